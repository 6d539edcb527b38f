//! CSS post-processing chain.
//!
//! The chain is described by a user-authored TOML file, loaded once at
//! startup and shared read-only (`Arc<PostProcessor>`) by every compile.
//! A missing file is the valid "disabled" state.
//!
//! ```toml
//! [[plugins]]
//! use = "strip-comments"
//!
//! [[plugins]]
//! use = "command"
//! program = "npx"
//! args = ["postcss", "--no-map"]
//! ```

use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::error::SyncError;

/// Post-processor failures
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    Exit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} produced non UTF-8 output")]
    Utf8 { program: String },

    #[error("invalid replace pattern")]
    Pattern(#[from] regex::Error),
}

/// Non-fatal message raised by a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub plugin: String,
    pub text: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.plugin, self.text)
    }
}

/// One stage of the chain. Implementations hold no per-request state
pub trait Plugin: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Transform `css`, pushing non-fatal messages onto `warnings`
    fn process(&self, css: String, warnings: &mut Vec<String>) -> Result<String, PluginError>;
}

/// Per-run options
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions<'a> {
    /// Output file the CSS is destined for
    pub to: &'a Path,
}

/// Result of a full chain run. Plugins work on CSS text only; no source map is carried
#[derive(Debug, Clone)]
pub struct Processed {
    pub css: String,
    pub warnings: Vec<Warning>,
}

/// Ordered plugin chain
#[derive(Debug, Default)]
pub struct PostProcessor {
    plugins: Vec<Box<dyn Plugin>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainFile {
    #[serde(default)]
    plugins: Vec<PluginSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "use", rename_all = "kebab-case")]
enum PluginSpec {
    StripComments,
    Banner {
        text: String,
    },
    Replace {
        pattern: String,
        replacement: String,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl PostProcessor {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Load the chain from `path`. A missing file disables post-processing
    pub fn load(path: &Path) -> Result<Option<Self>, SyncError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| SyncError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
            .map(Some)
            .map_err(|e| SyncError::Config {
                message: format!("{}: {}", path.display(), e),
            })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SyncError> {
        let file: ChainFile = toml::from_str(raw).map_err(|e| SyncError::Config {
            message: e.to_string(),
        })?;

        let mut plugins: Vec<Box<dyn Plugin>> = Vec::with_capacity(file.plugins.len());
        for spec in file.plugins {
            let plugin: Box<dyn Plugin> = match spec {
                PluginSpec::StripComments => Box::new(StripComments),
                PluginSpec::Banner { text } => Box::new(Banner { text }),
                PluginSpec::Replace {
                    pattern,
                    replacement,
                } => Box::new(Replace::new(&pattern, replacement).map_err(|e| {
                    SyncError::Config {
                        message: e.to_string(),
                    }
                })?),
                PluginSpec::Command { program, args } => Box::new(External { program, args }),
            };
            plugins.push(plugin);
        }

        Ok(Self::new(plugins))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin in order
    pub fn process(
        &self,
        css: &str,
        options: ProcessOptions<'_>,
    ) -> Result<Processed, PluginError> {
        let mut css = css.to_string();
        let mut warnings = Vec::new();

        for plugin in &self.plugins {
            let mut raised = Vec::new();
            css = plugin.process(css, &mut raised)?;
            warnings.extend(raised.into_iter().map(|text| Warning {
                plugin: plugin.name().to_string(),
                text,
            }));
        }

        tracing::trace!(to = %options.to.display(), plugins = self.plugins.len(), "post-processed");

        Ok(Processed {
            css,
            warnings,
        })
    }
}

/// Drops `/* */` comments, keeping `/*!` license comments
#[derive(Debug)]
pub struct StripComments;

impl Plugin for StripComments {
    fn name(&self) -> &str {
        "strip-comments"
    }

    fn process(&self, css: String, _warnings: &mut Vec<String>) -> Result<String, PluginError> {
        if !css.contains("/*") {
            return Ok(css);
        }

        let bytes = css.as_bytes();
        let mut out = String::with_capacity(css.len());
        let mut quote: Option<u8> = None;
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(q) => {
                    if b == b'\\' {
                        i += 1;
                    } else if b == q {
                        quote = None;
                    }
                }
                None if b == b'"' || b == b'\'' => quote = Some(b),
                None if b == b'/' && bytes.get(i + 1) == Some(&b'*') => {
                    let keep = bytes.get(i + 2) == Some(&b'!');
                    let end = css[i + 2..]
                        .find("*/")
                        .map(|p| i + 2 + p + 2)
                        .unwrap_or(bytes.len());
                    if !keep {
                        out.push_str(&css[start..i]);
                        start = end;
                    }
                    i = end;
                    continue;
                }
                None => {}
            }
            i += 1;
        }
        out.push_str(&css[start.min(css.len())..]);

        Ok(out)
    }
}

/// Prepends a fixed banner once
#[derive(Debug)]
pub struct Banner {
    pub text: String,
}

impl Plugin for Banner {
    fn name(&self) -> &str {
        "banner"
    }

    fn process(&self, css: String, _warnings: &mut Vec<String>) -> Result<String, PluginError> {
        if css.starts_with(&self.text) {
            return Ok(css);
        }
        Ok(format!("{}{}", self.text, css))
    }
}

/// Regex find/replace over the whole stylesheet
#[derive(Debug)]
pub struct Replace {
    pattern: Regex,
    replacement: String,
}

impl Replace {
    pub fn new(pattern: &str, replacement: String) -> Result<Self, PluginError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement,
        })
    }
}

impl Plugin for Replace {
    fn name(&self) -> &str {
        "replace"
    }

    fn process(&self, css: String, _warnings: &mut Vec<String>) -> Result<String, PluginError> {
        match self.pattern.replace_all(&css, self.replacement.as_str()) {
            Cow::Borrowed(_) => Ok(css),
            Cow::Owned(replaced) => Ok(replaced),
        }
    }
}

/// External processor: CSS on stdin, CSS on stdout, stderr lines are warnings
#[derive(Debug)]
pub struct External {
    pub program: String,
    pub args: Vec<String>,
}

impl Plugin for External {
    fn name(&self) -> &str {
        &self.program
    }

    fn process(&self, css: String, warnings: &mut Vec<String>) -> Result<String, PluginError> {
        let spawn_error = |source| PluginError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        // Feed stdin from a separate thread so a full stdout pipe cannot stall us
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(css.as_bytes()))
        });

        let output = child.wait_with_output().map_err(spawn_error)?;
        if let Some(handle) = writer {
            if let Ok(Err(e)) = handle.join() {
                tracing::debug!(program = %self.program, error = %e, "stdin closed early");
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(PluginError::Exit {
                program: self.program.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        warnings.extend(
            stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );

        String::from_utf8(output.stdout).map_err(|_| PluginError::Utf8 {
            program: self.program.clone(),
        })
    }
}
