//! Role, key, and descriptor types for the watch-transform-sync pipeline.
//!
//! Provides type-safe wrappers for asset keys and destination ids using
//! `Arc<str>`, the closed `Role` enumeration, and the per-event file
//! descriptor produced by the classifier.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{SpriteConfig, StyleConfig};

/// Remote asset key in "dir/name" format (e.g., "assets/main.css").
/// Newtype wrapper for type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey(Arc<str>);

impl AssetKey {
    /// Create a new AssetKey, normalizing separators to forward slashes
    pub fn new(s: &str) -> Self {
        Self(Arc::from(s.replace('\\', "/")))
    }

    /// Build the key of `output` relative to `output_root`
    pub fn from_output(output_root: &Path, output: &Path) -> Self {
        let relative = output.strip_prefix(output_root).unwrap_or(output);
        Self::new(&to_slash(relative))
    }

    /// Get the inner string reference
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Destination id in "domain/theme_id" format (e.g., "shop.myshopify.com/123").
/// Identifies one remote store+theme target and its delivery stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationId(Arc<str>);

impl DestinationId {
    /// Create a new DestinationId from a store domain and theme id
    pub fn new(domain: &str, theme_id: u64) -> Self {
        Self(Arc::from(format!("{}/{}", domain, theme_id)))
    }

    /// Get the inner string reference
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

/// Theme file role, decides where the compiled artifact lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Asset,
    Snippet,
    Section,
    Layout,
    Template,
    Config,
    Locale,
    Metafield,
}

impl Role {
    /// Output directory name under the theme root
    #[inline]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Role::Asset => "assets",
            Role::Snippet => "snippets",
            Role::Section => "sections",
            Role::Layout => "layout",
            Role::Template => "templates",
            Role::Config => "config",
            Role::Locale => "locales",
            Role::Metafield => "metafields",
        }
    }

    #[inline]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assets" => Some(Role::Asset),
            "snippets" => Some(Role::Snippet),
            "sections" => Some(Role::Section),
            "layout" => Some(Role::Layout),
            "templates" | "customers" => Some(Role::Template),
            "config" => Some(Role::Config),
            "locales" => Some(Role::Locale),
            "metafields" => Some(Role::Metafield),
            _ => None,
        }
    }
}

/// Stylesheet source syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleSyntax {
    /// SCSS source, compiled before post-processing
    Scss,
    /// Plain CSS, post-processed only
    Css,
}

impl StyleSyntax {
    /// Detect syntax from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match extension(path).as_deref() {
            Some("scss") | Some("sass") => Some(StyleSyntax::Scss),
            Some("css") => Some(StyleSyntax::Css),
            _ => None,
        }
    }
}

/// Per-role configuration carried by a descriptor. Selects the transform
#[derive(Debug, Clone)]
pub enum RoleConfig {
    /// Stylesheet entry with its style config
    Style {
        syntax: StyleSyntax,
        config: Arc<StyleConfig>,
    },
    /// Single SVG emitted as an inline snippet
    InlineIcon,
    /// SVG sprite rebuilt from all of its member files
    Sprite(Arc<SpriteConfig>),
    /// Liquid/HTML view
    View,
    /// JSON document (templates, config, locales, metafields)
    Json,
    /// Copied as-is
    Passthrough,
}

/// Typed description of one observed path. Immutable, lives for one transform cycle
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Path the filesystem event fired on
    pub observed_path: PathBuf,
    /// File the transform reads (differs for partials and sprite members)
    pub source_path: PathBuf,
    /// Compiled output path under the output root
    pub output_path: PathBuf,
    /// Remote asset key
    pub key: AssetKey,
    /// Theme role
    pub role: Role,
    /// Per-role configuration
    pub config: RoleConfig,
}

impl FileDescriptor {
    /// True when the observed file only feeds another entry (partial, sprite member)
    pub fn is_dependency(&self) -> bool {
        matches!(self.config, RoleConfig::Sprite(_)) || self.observed_path != self.source_path
    }
}

/// Raw filesystem change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Add,
    Change,
    Unlink,
}

impl RawEventKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            RawEventKind::Add => "add",
            RawEventKind::Change => "change",
            RawEventKind::Unlink => "unlink",
        }
    }
}

/// Transform event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Delete,
}

/// A classified event, consumed once by dispatch
#[derive(Debug, Clone)]
pub struct TransformEvent {
    pub kind: EventKind,
    pub descriptor: FileDescriptor,
}

impl TransformEvent {
    /// Derive the event kind from a raw filesystem event.
    /// Removing a dependency rebuilds its owner instead of deleting it.
    pub fn from_raw(raw: RawEventKind, descriptor: FileDescriptor) -> Self {
        let kind = match raw {
            RawEventKind::Add | RawEventKind::Change => EventKind::Update,
            RawEventKind::Unlink if descriptor.is_dependency() => EventKind::Update,
            RawEventKind::Unlink => EventKind::Delete,
        };
        Self { kind, descriptor }
    }
}

/// Render a path with forward slashes
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lowercased file extension
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(observed: &str, source: &str) -> FileDescriptor {
        FileDescriptor {
            observed_path: PathBuf::from(observed),
            source_path: PathBuf::from(source),
            output_path: PathBuf::from("theme/assets/main.css"),
            key: AssetKey::new("assets/main.css"),
            role: Role::Asset,
            config: RoleConfig::Passthrough,
        }
    }

    // AssetKey tests
    #[test]
    fn test_asset_key_from_output() {
        let key = AssetKey::from_output(
            Path::new("/work/theme"),
            Path::new("/work/theme/templates/customers/login.liquid"),
        );
        assert_eq!(key.as_str(), "templates/customers/login.liquid");
    }

    #[test]
    fn test_asset_key_normalizes_backslashes() {
        let key = AssetKey::new("assets\\main.css");
        assert_eq!(key.as_str(), "assets/main.css");
    }

    #[test]
    fn test_asset_key_display() {
        let key: AssetKey = "snippets/icon.liquid".into();
        assert_eq!(format!("{}", key), "snippets/icon.liquid");
    }

    // DestinationId tests
    #[test]
    fn test_destination_id_new() {
        let id = DestinationId::new("shop.myshopify.com", 42);
        assert_eq!(id.as_str(), "shop.myshopify.com/42");
    }

    // Role tests
    #[test]
    fn test_role_dir_names() {
        assert_eq!(Role::Asset.dir_name(), "assets");
        assert_eq!(Role::Layout.dir_name(), "layout");
        assert_eq!(Role::Metafield.dir_name(), "metafields");
    }

    #[test]
    fn test_role_parse_customers_is_template() {
        assert_eq!(Role::parse("customers"), Some(Role::Template));
        assert_eq!(Role::parse("locales"), Some(Role::Locale));
        assert_eq!(Role::parse("styles"), None);
    }

    // StyleSyntax tests
    #[test]
    fn test_style_syntax_from_path() {
        assert_eq!(
            StyleSyntax::from_path(Path::new("a/main.SCSS")),
            Some(StyleSyntax::Scss)
        );
        assert_eq!(
            StyleSyntax::from_path(Path::new("a/base.css")),
            Some(StyleSyntax::Css)
        );
        assert_eq!(StyleSyntax::from_path(Path::new("a/base.js")), None);
    }

    // TransformEvent tests
    #[test]
    fn test_transform_event_add_and_change_are_updates() {
        let d = descriptor("styles/main.scss", "styles/main.scss");
        assert_eq!(
            TransformEvent::from_raw(RawEventKind::Add, d.clone()).kind,
            EventKind::Update
        );
        assert_eq!(
            TransformEvent::from_raw(RawEventKind::Change, d).kind,
            EventKind::Update
        );
    }

    #[test]
    fn test_transform_event_unlink_is_delete() {
        let d = descriptor("assets/logo.png", "assets/logo.png");
        assert_eq!(
            TransformEvent::from_raw(RawEventKind::Unlink, d).kind,
            EventKind::Delete
        );
    }

    #[test]
    fn test_transform_event_unlink_partial_rebuilds_owner() {
        let d = descriptor("styles/_vars.scss", "styles/main.scss");
        assert!(d.is_dependency());
        assert_eq!(
            TransformEvent::from_raw(RawEventKind::Unlink, d).kind,
            EventKind::Update
        );
    }

    #[test]
    fn test_to_slash() {
        assert_eq!(to_slash(Path::new("source/assets/a.js")), "source/assets/a.js");
    }
}
