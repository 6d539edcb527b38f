//! SVG icon snippets and sprites.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use crate::config::{SpriteConfig, SpriteOptions, MATCH_OPTIONS};
use crate::error::SyncError;

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Root attributes carried over to each `<symbol>`
const SYMBOL_ATTRIBUTES: [&[u8]; 4] = [b"viewBox", b"preserveAspectRatio", b"fill", b"stroke"];

/// Elements dropped together with their content
fn dropped(name: &[u8]) -> bool {
    matches!(name, b"metadata" | b"title" | b"desc")
}

fn read_event<'i>(reader: &mut Reader<&'i [u8]>, path: &Path) -> Result<Event<'i>, SyncError> {
    match reader.read_event() {
        Ok(event) => Ok(event),
        Err(e) => Err(SyncError::compile(
            path,
            format!("{} at byte {}", e, reader.buffer_position()),
        )),
    }
}

fn write_event(
    writer: &mut Writer<Vec<u8>>,
    path: &Path,
    event: Event<'_>,
) -> Result<(), SyncError> {
    writer
        .write_event(event)
        .map_err(|e| SyncError::compile(path, e))
}

fn xml_reader(source: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(source);
    reader.trim_text(true);
    reader
}

/// Optimize a standalone SVG for inlining
pub fn inline(path: &Path, source: &str) -> Result<Vec<u8>, SyncError> {
    let mut reader = xml_reader(source);
    let mut writer = Writer::new(Vec::with_capacity(source.len()));
    let mut skip = 0usize;

    loop {
        match read_event(&mut reader, path)? {
            Event::Eof => break,
            Event::Decl(_) | Event::DocType(_) | Event::Comment(_) | Event::PI(_) => {}
            Event::Start(e) if skip > 0 || dropped(e.local_name().as_ref()) => skip += 1,
            Event::End(_) if skip > 0 => skip -= 1,
            _ if skip > 0 => {}
            Event::Empty(e) if dropped(e.local_name().as_ref()) => {}
            event => write_event(&mut writer, path, event)?,
        }
    }

    Ok(writer.into_inner())
}

/// Member files of a sprite, sorted and de-duplicated
pub fn sprite_members(cwd: &Path, config: &SpriteConfig) -> Result<Vec<PathBuf>, SyncError> {
    let root = glob::Pattern::escape(&cwd.to_string_lossy());
    let mut members = BTreeSet::new();

    for pattern in config.input.patterns() {
        let absolute = format!("{}/{}", root, pattern);
        let paths = glob::glob_with(&absolute, MATCH_OPTIONS).map_err(|e| SyncError::Config {
            message: format!("icons.sprites.input: {}", e),
        })?;
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => {
                    members.insert(path);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(sprite = %config.name, error = %e, "skipping unreadable sprite member")
                }
            }
        }
    }

    Ok(members.into_iter().collect())
}

/// Rebuild a sprite from every member currently on disk
pub fn sprite(cwd: &Path, config: &SpriteConfig) -> Result<Vec<u8>, SyncError> {
    let members = sprite_members(cwd, config)?;
    debug!(sprite = %config.name, members = members.len(), "building sprite");

    let mut sources = Vec::with_capacity(members.len());
    for path in members {
        let source = std::fs::read_to_string(&path).map_err(|source| SyncError::Read {
            path: path.clone(),
            source,
        })?;
        sources.push((path, source));
    }

    build_sprite(&config.options, &sources)
}

/// Assemble `(path, svg source)` members into one hidden `<svg>` of symbols
pub fn build_sprite(
    options: &SpriteOptions,
    members: &[(PathBuf, String)],
) -> Result<Vec<u8>, SyncError> {
    let mut writer = Writer::new(Vec::new());
    let sprite_path = Path::new("sprite");

    let mut root = BytesStart::new("svg");
    root.push_attribute(("xmlns", SVG_NS));
    root.push_attribute(("style", "display:none"));
    for (key, value) in &options.root_attributes {
        root.push_attribute((key.as_str(), value.as_str()));
    }
    write_event(&mut writer, sprite_path, Event::Start(root))?;

    for (path, source) in members {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| SyncError::compile(path, "sprite member has no file name"))?;
        write_symbol(&mut writer, path, &stem, source, options)?;
    }

    write_event(&mut writer, sprite_path, Event::End(BytesEnd::new("svg")))?;
    Ok(writer.into_inner())
}

fn write_symbol(
    writer: &mut Writer<Vec<u8>>,
    path: &Path,
    stem: &str,
    source: &str,
    options: &SpriteOptions,
) -> Result<(), SyncError> {
    let mut reader = xml_reader(source);
    let mut depth = 0usize;
    let mut skip = 0usize;
    let mut found = false;

    loop {
        match read_event(&mut reader, path)? {
            Event::Eof => break,
            Event::Start(e) if depth == 0 && e.local_name().as_ref() == b"svg" => {
                found = true;
                depth = 1;
                write_event(writer, path, Event::Start(symbol(path, stem, &e, options)?))?;
            }
            Event::Empty(e) if depth == 0 && e.local_name().as_ref() == b"svg" => {
                found = true;
                write_event(writer, path, Event::Empty(symbol(path, stem, &e, options)?))?;
            }
            _ if depth == 0 => {}
            Event::Decl(_) | Event::DocType(_) | Event::Comment(_) | Event::PI(_) => {}
            Event::Start(e) if skip > 0 || dropped(e.local_name().as_ref()) => skip += 1,
            Event::End(_) if skip > 0 => skip -= 1,
            _ if skip > 0 => {}
            Event::Empty(e) if dropped(e.local_name().as_ref()) => {}
            Event::End(_) if depth == 1 => {
                depth = 0;
                write_event(writer, path, Event::End(BytesEnd::new("symbol")))?;
            }
            Event::Start(e) => {
                depth += 1;
                write_event(writer, path, Event::Start(namespaced(path, stem, e, options)?))?;
            }
            Event::End(e) => {
                depth -= 1;
                write_event(writer, path, Event::End(e))?;
            }
            Event::Empty(e) => {
                write_event(writer, path, Event::Empty(namespaced(path, stem, e, options)?))?;
            }
            event => write_event(writer, path, event)?,
        }
    }

    if !found {
        return Err(SyncError::compile(path, "no <svg> root element"));
    }
    Ok(())
}

/// `<symbol id="<stem>">` carrying the member root's presentation attributes
fn symbol(
    path: &Path,
    stem: &str,
    root: &BytesStart<'_>,
    options: &SpriteOptions,
) -> Result<BytesStart<'static>, SyncError> {
    let mut symbol = BytesStart::new("symbol");
    symbol.push_attribute(("id", stem));

    for attr in root.attributes() {
        let attr = attr.map_err(|e| SyncError::compile(path, e))?;
        let key = attr.key.as_ref();
        let keep = SYMBOL_ATTRIBUTES.contains(&key)
            || (options.dimension_attributes && matches!(key, b"width" | b"height"));
        if keep {
            let value = attr.unescape_value().map_err(|e| SyncError::compile(path, e))?;
            symbol.push_attribute((&*String::from_utf8_lossy(key), &*value));
        }
    }

    Ok(symbol)
}

/// Prefix ids and local references with the symbol id
fn namespaced<'a>(
    path: &Path,
    stem: &str,
    element: BytesStart<'a>,
    options: &SpriteOptions,
) -> Result<BytesStart<'a>, SyncError> {
    if !options.namespace_ids {
        return Ok(element);
    }

    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut rewritten = BytesStart::new(name);
    for attr in element.attributes() {
        let attr = attr.map_err(|e| SyncError::compile(path, e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| SyncError::compile(path, e))?;
        let value = namespace_value(stem, &key, value);
        rewritten.push_attribute((key.as_str(), &*value));
    }

    Ok(rewritten)
}

fn namespace_value<'v>(stem: &str, key: &str, value: Cow<'v, str>) -> Cow<'v, str> {
    if key == "id" {
        return Cow::Owned(format!("{}-{}", stem, value));
    }
    if key.ends_with("href") {
        if let Some(target) = value.strip_prefix('#') {
            return Cow::Owned(format!("#{}-{}", stem, target));
        }
    }
    if value.contains("url(#") {
        return Cow::Owned(value.replace("url(#", &format!("url(#{}-", stem)));
    }
    value
}
