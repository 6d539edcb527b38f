//! Per-role transforms.
//!
//! `Transforms` owns every transform's read-only state (compiled regexes,
//! the post-processing chain) and maps a descriptor's `RoleConfig` to the
//! transform that handles it with one exhaustive `match`.

pub mod icons;
pub mod json;
pub mod postcss;
pub mod styles;
pub mod views;

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::Config;
use crate::error::SyncError;
use crate::files::write_output;
use crate::queue::AssetRequest;
use crate::role::{AssetKey, FileDescriptor, RoleConfig};

use self::json::JsonTransform;
use self::postcss::PostProcessor;
use self::styles::StyleTransform;
use self::views::ViewTransform;

/// Transport encoding of an artifact's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Base64,
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentEncoding::Base64 => write!(f, "base64"),
        }
    }
}

/// Transformed bytes ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub bytes: Vec<u8>,
    pub key: AssetKey,
    pub encoding: ContentEncoding,
}

impl CompiledArtifact {
    pub fn new(key: AssetKey, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            key,
            encoding: ContentEncoding::Base64,
        }
    }

    /// Encoded payload as sent in the `attachment` field
    pub fn attachment(&self) -> String {
        match self.encoding {
            ContentEncoding::Base64 => STANDARD.encode(&self.bytes),
        }
    }

    /// Upsert request for this artifact
    pub fn request(&self) -> AssetRequest {
        AssetRequest::Put {
            key: self.key.clone(),
            attachment: Arc::from(self.attachment()),
        }
    }
}

/// Every transform, built once from the runtime config
#[derive(Debug)]
pub struct Transforms {
    config: Arc<Config>,
    styles: StyleTransform,
    views: ViewTransform,
    json: JsonTransform,
}

impl Transforms {
    pub fn new(
        config: Arc<Config>,
        postcss: Option<Arc<PostProcessor>>,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            styles: StyleTransform::new(postcss),
            views: ViewTransform::new(config.views.minify.clone())?,
            json: JsonTransform::new(config.json.clone()),
            config,
        })
    }

    /// Build transforms, loading the post-processing chain named by the config
    pub fn from_config(config: Arc<Config>) -> Result<Self, SyncError> {
        let postcss = match &config.postcss {
            Some(path) => PostProcessor::load(path)?.map(Arc::new),
            None => None,
        };
        if let (Some(path), Some(chain)) = (&config.postcss, &postcss) {
            tracing::info!(
                path = %path.display(),
                plugins = chain.len(),
                "post-processing enabled"
            );
        }
        Self::new(config, postcss)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn styles(&self) -> &StyleTransform {
        &self.styles
    }

    /// Sprites rebuild from their member files instead of the source path
    pub fn reads_source(descriptor: &FileDescriptor) -> bool {
        !matches!(descriptor.config, RoleConfig::Sprite(_))
    }

    /// Run the transform selected by the descriptor's role config.
    /// `source` is ignored for sprites
    pub fn apply(&self, descriptor: &FileDescriptor, source: &[u8]) -> Result<Vec<u8>, SyncError> {
        let relative = self.config.relative(&descriptor.source_path);

        match &descriptor.config {
            RoleConfig::Style { syntax, config } => {
                let text = utf8(descriptor, source)?;
                self.styles.compile(descriptor, *syntax, config, text)
            }
            RoleConfig::InlineIcon => {
                icons::inline(&descriptor.source_path, utf8(descriptor, source)?)
            }
            RoleConfig::Sprite(sprite) => icons::sprite(&self.config.cwd, sprite),
            RoleConfig::View => self.views.transform(&relative, source),
            RoleConfig::Json => self.json.transform(&relative, source),
            RoleConfig::Passthrough => Ok(source.to_vec()),
        }
    }

    /// Read, transform and write one descriptor synchronously
    pub fn run(&self, descriptor: &FileDescriptor) -> Result<CompiledArtifact, SyncError> {
        let source = if Self::reads_source(descriptor) {
            std::fs::read(&descriptor.source_path).map_err(|source| SyncError::Read {
                path: descriptor.source_path.clone(),
                source,
            })?
        } else {
            Vec::new()
        };

        let bytes = self.apply(descriptor, &source)?;
        write_output(&descriptor.output_path, &bytes)?;

        Ok(CompiledArtifact::new(descriptor.key.clone(), bytes))
    }
}

fn utf8<'a>(descriptor: &FileDescriptor, source: &'a [u8]) -> Result<&'a str, SyncError> {
    std::str::from_utf8(source)
        .map_err(|e| SyncError::compile(&descriptor.source_path, format!("not UTF-8: {}", e)))
}
