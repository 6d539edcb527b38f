use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

use crate::error::SyncError;

/// Directories never scanned or watched
const IGNORED_DIRECTORIES: &[&str] = &["node_modules", ".git", ".svn", ".hg"];

/// Extensions polled on the slower binary interval
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "avif", "ico", "bmp", "tif", "tiff", // images
    "woff", "woff2", "ttf", "otf", "eot", // fonts
    "mp3", "mp4", "webm", "ogg", "wav", "mov", // media
    "pdf", "zip", "gz", // archives
];

/// True for source-map files and anything under an ignored directory
#[inline]
pub fn is_ignored(path: &Path) -> bool {
    let in_ignored_dir = path.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRECTORIES.contains(&name)),
        _ => false,
    });

    in_ignored_dir || is_source_map(path)
}

#[inline]
pub fn is_source_map(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("map"))
}

/// True for binary files (images, fonts, media)
#[inline]
pub fn is_binary(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Every non-ignored file under `root`, sorted
pub fn scan_sources(root: &Path, shutdown: &AtomicBool) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRECTORIES.contains(&name))
        })
        .filter_map(|e| e.ok())
    {
        // Check for cancellation
        if shutdown.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }

        if !entry.file_type().is_file() || is_source_map(entry.path()) {
            continue;
        }

        files.push(entry.into_path());
    }

    files.sort();
    Ok(files)
}

fn write_error(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Write compiled bytes to `path`, creating parent directories
pub fn write_output(path: &Path, bytes: &[u8]) -> Result<u64, SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }
    }

    fs::write(path, bytes).map_err(|e| write_error(path, e))?;
    Ok(bytes.len() as u64)
}

/// Async variant of [`write_output`] for the watch loop
pub async fn write_output_async(path: &Path, bytes: &[u8]) -> Result<u64, SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(parent, e))?;
    }

    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| write_error(path, e))?;
    Ok(bytes.len() as u64)
}

/// Remove a compiled output. Returns false when it was already gone
pub async fn remove_output(path: &Path) -> Result<bool, SyncError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(write_error(path, e)),
    }
}
