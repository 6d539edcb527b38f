//! Maps observed filesystem paths to typed file descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, RoleMatcher};
use crate::error::SyncError;
use crate::role::{extension, AssetKey, FileDescriptor, Role, RoleConfig, StyleSyntax};

/// First matcher whose globs accept `relative`. Order is part of the contract
pub fn match_role<'a>(relative: &str, matchers: &'a [RoleMatcher]) -> Option<&'a RoleMatcher> {
    matchers.iter().find(|m| m.globs.matches(relative))
}

/// Path classifier. Holds no per-path state, so the same path always maps
/// to the same descriptor for a given config
#[derive(Debug, Clone)]
pub struct Classifier {
    config: Arc<Config>,
}

impl Classifier {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Classify one path (absolute, or relative to the project root)
    pub fn classify(&self, path: &Path) -> Result<FileDescriptor, SyncError> {
        let observed = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.cwd.join(path)
        };
        let relative = self.config.relative(&observed);

        if let Some(descriptor) = self.classify_style(&observed, &relative) {
            return Ok(descriptor);
        }

        if let Some(descriptor) = self.classify_icon(&observed, &relative) {
            return Ok(descriptor);
        }

        let matcher = match_role(&relative, &self.config.matchers).ok_or_else(|| {
            SyncError::UnclassifiedPath {
                path: observed.clone(),
            }
        })?;

        let file_name = file_name(&observed)?;
        let file_name = match matcher.role {
            Role::Section => self.section_name(&observed, &relative, file_name),
            _ => file_name.to_string(),
        };

        let config = match (matcher.role, extension(&observed).as_deref()) {
            (Role::Asset, _) => RoleConfig::Passthrough,
            (_, Some("liquid")) | (_, Some("html")) => RoleConfig::View,
            (_, Some("json")) => RoleConfig::Json,
            _ => RoleConfig::Passthrough,
        };

        let output_path = self.config.output.join(&matcher.output_dir).join(file_name);

        Ok(FileDescriptor {
            key: AssetKey::from_output(&self.config.output, &output_path),
            source_path: observed.clone(),
            observed_path: observed,
            output_path,
            role: matcher.role,
            config,
        })
    }

    /// Stylesheet inputs and the partials their watch globs cover
    fn classify_style(&self, observed: &Path, relative: &str) -> Option<FileDescriptor> {
        StyleSyntax::from_path(observed)?;

        // An entry's own input always wins over another entry's watch globs
        let styles = &self.config.styles;
        let style = styles
            .iter()
            .find(|s| s.input == observed)
            .or_else(|| styles.iter().find(|s| s.watch.matches(relative)))?;

        let syntax = StyleSyntax::from_path(&style.input)?;
        let stem = style.input.file_stem()?.to_string_lossy().to_string();

        let (role, output_path) = if style.snippet {
            (
                Role::Snippet,
                self.config
                    .output
                    .join(Role::Snippet.dir_name())
                    .join(format!("{}.liquid", stem)),
            )
        } else {
            (
                Role::Asset,
                self.config
                    .output
                    .join(Role::Asset.dir_name())
                    .join(format!("{}.css", stem)),
            )
        };

        Some(FileDescriptor {
            observed_path: observed.to_path_buf(),
            source_path: style.input.clone(),
            key: AssetKey::from_output(&self.config.output, &output_path),
            output_path,
            role,
            config: RoleConfig::Style {
                syntax,
                config: Arc::clone(style),
            },
        })
    }

    /// Sprite members first, then inline icon snippets
    fn classify_icon(&self, observed: &Path, relative: &str) -> Option<FileDescriptor> {
        if extension(observed).as_deref() != Some("svg") {
            return None;
        }

        let icons = &self.config.icons;
        let (name, config) = if let Some(sprite) =
            icons.sprites.iter().find(|s| s.input.matches(relative))
        {
            (sprite.name.clone(), RoleConfig::Sprite(Arc::clone(sprite)))
        } else if icons.snippets.matches(relative) {
            (
                observed.file_stem()?.to_string_lossy().to_string(),
                RoleConfig::InlineIcon,
            )
        } else {
            return None;
        };

        let output_path = self
            .config
            .output
            .join(Role::Snippet.dir_name())
            .join(format!("{}.liquid", name));

        Some(FileDescriptor {
            observed_path: observed.to_path_buf(),
            source_path: observed.to_path_buf(),
            key: AssetKey::from_output(&self.config.output, &output_path),
            output_path,
            role: Role::Snippet,
            config,
        })
    }

    /// Nested sections become `<parent><separator><name>` when prefixing is on
    fn section_name(&self, observed: &Path, relative: &str, file_name: &str) -> String {
        let sections = &self.config.views.sections;
        if !sections.allow_prefix || sections.globals.matches(relative) {
            return file_name.to_string();
        }

        match observed
            .parent()
            .and_then(Path::file_name)
            .map(|p| p.to_string_lossy())
        {
            Some(parent) if parent != Role::Section.dir_name() => {
                format!("{}{}{}", parent, sections.prefix_separator, file_name)
            }
            _ => file_name.to_string(),
        }
    }
}

fn file_name(path: &Path) -> Result<&str, SyncError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::UnclassifiedPath {
            path: PathBuf::from(path),
        })
}
