//! CLI configuration and runtime settings for the sync pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use glob::{MatchOptions, Pattern, PatternError};
use serde::Deserialize;

use crate::error::SyncError;
use crate::logging::LogFormat;
use crate::role::{DestinationId, Role};

/// Default config file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "theme-sync.toml";

/// Default environment variable holding the Admin API access token
pub const DEFAULT_TOKEN_ENV: &str = "SHOPIFY_ACCESS_TOKEN";

/// Watch, transform and synchronize theme sources to remote stores
#[derive(Parser, Debug)]
#[command(name = "theme-sync")]
#[command(version)]
#[command(about = "Watch, transform and synchronize theme sources to remote stores")]
pub struct Cli {
    /// Project root directory
    #[arg(long, global = true, default_value = ".")]
    pub cwd: PathBuf,

    /// Config file, relative to the project root
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch the source tree and sync every change
    Watch(WatchArgs),
    /// Transform the whole source tree once and upload it
    Build(BuildArgs),
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    /// Poll interval in milliseconds (overrides watcher.interval_ms)
    #[arg(short, long)]
    pub interval: Option<u64>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Number of parallel workers
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub jobs: usize,
}

/// Glob semantics shared by matching and filesystem expansion
pub const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled list of glob patterns, matched against cwd-relative slash paths
#[derive(Debug, Clone, Default)]
pub struct Globs(Vec<Pattern>);

impl Globs {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// True if any pattern accepts `relative`. `*` never crosses a `/`
    pub fn matches(&self, relative: &str) -> bool {
        self.0.iter().any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pattern sources, for expansion against the filesystem
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|p| p.as_str())
    }
}

impl TryFrom<Vec<String>> for Globs {
    type Error = PatternError;

    fn try_from(patterns: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(&patterns)
    }
}

impl<'de> Deserialize<'de> for Globs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let patterns = Vec::<String>::deserialize(deserializer)?;
        Globs::try_from(patterns).map_err(serde::de::Error::custom)
    }
}

// ==================== On-disk config ====================

/// Raw `theme-sync.toml` contents. Every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<String>,
    pub output: Option<String>,
    pub node_modules: Option<String>,
    pub watch: Option<Vec<String>>,
    pub paths: PathsFile,
    pub styles: StylesFile,
    pub icons: IconsFile,
    pub views: ViewsConfig,
    pub json: JsonConfig,
    pub queue: QueueConfig,
    pub watcher: WatcherConfig,
    pub destinations: Vec<DestinationFile>,
}

/// Role matcher globs, in matching order
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsFile {
    pub assets: Option<Vec<String>>,
    pub snippets: Option<Vec<String>>,
    pub sections: Option<Vec<String>>,
    pub layout: Option<Vec<String>>,
    pub templates: Option<Vec<String>>,
    pub customers: Option<Vec<String>>,
    pub config: Option<Vec<String>>,
    pub locales: Option<Vec<String>>,
    pub metafields: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesFile {
    /// Post-processing chain file, relative to the project root
    pub postcss: Option<String>,
    pub compile: Vec<StyleFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StyleFile {
    pub input: String,
    #[serde(default)]
    pub snippet: bool,
    #[serde(default)]
    pub watch: Option<Vec<String>>,
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IconsFile {
    pub snippets: Vec<String>,
    pub sprites: Vec<SpriteFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpriteFile {
    pub input: Vec<String>,
    pub output: String,
    #[serde(default)]
    pub options: SpriteOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationFile {
    pub store: String,
    pub theme_id: u64,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Assets endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_target() -> String {
    "dev".to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

// ==================== Resolved settings ====================

/// One stylesheet entry. Read-only for the pipeline's lifetime
#[derive(Debug, Clone)]
pub struct StyleConfig {
    /// Entry stylesheet (absolute)
    pub input: PathBuf,
    /// Wrap output in `<style>` and emit it as a snippet
    pub snippet: bool,
    /// Paths whose changes recompile this entry
    pub watch: Globs,
    /// Extra import search paths (absolute)
    pub include: Vec<PathBuf>,
    /// Target of `~` imports (absolute)
    pub node_modules: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpriteOptions {
    /// Keep width/height attributes on each symbol
    pub dimension_attributes: bool,
    /// Prefix ids inside each symbol with the symbol id
    pub namespace_ids: bool,
    /// Extra attributes on the sprite root element
    pub root_attributes: BTreeMap<String, String>,
}

/// One SVG sprite snippet
#[derive(Debug, Clone)]
pub struct SpriteConfig {
    /// Snippet name, without extension
    pub name: String,
    /// Member SVG files
    pub input: Globs,
    pub options: SpriteOptions,
}

#[derive(Debug, Clone, Default)]
pub struct IconsConfig {
    /// SVGs emitted one-by-one as inline snippets
    pub snippets: Globs,
    pub sprites: Vec<Arc<SpriteConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewsConfig {
    pub sections: SectionsConfig,
    pub minify: ViewMinifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SectionsConfig {
    /// Prefix nested sections with their parent directory name
    pub allow_prefix: bool,
    pub prefix_separator: String,
    /// Sections never prefixed
    pub globals: Globs,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self {
            allow_prefix: false,
            prefix_separator: "-".to_string(),
            globals: Globs::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewMinifyConfig {
    pub apply: bool,
    pub remove_comments: bool,
    pub collapse_whitespace: bool,
    pub remove_liquid_comments: bool,
    pub minify_section_schema: bool,
    pub exclude: Globs,
}

impl Default for ViewMinifyConfig {
    fn default() -> Self {
        Self {
            apply: false,
            remove_comments: true,
            collapse_whitespace: true,
            remove_liquid_comments: true,
            minify_section_schema: true,
            exclude: Globs::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonConfig {
    pub allow_comments: bool,
    pub minify: JsonMinifyConfig,
}

impl Default for JsonConfig {
    fn default() -> Self {
        Self {
            allow_comments: true,
            minify: JsonMinifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonMinifyConfig {
    pub apply: bool,
    /// Drop the top-level `$schema` key
    pub remove_schema_refs: bool,
    pub exclude: Globs,
}

/// Delivery retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Attempt ceiling per entry, first try included
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// Poll intervals for the filesystem watcher
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    pub interval_ms: u64,
    pub binary_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            binary_interval_ms: 100,
        }
    }
}

impl WatcherConfig {
    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[inline]
    pub fn binary_interval(&self) -> Duration {
        Duration::from_millis(self.binary_interval_ms.max(1))
    }
}

/// A remote store+theme target
#[derive(Debug, Clone)]
pub struct Destination {
    pub id: DestinationId,
    pub store: String,
    /// e.g. `shop.myshopify.com`
    pub domain: String,
    pub theme_id: u64,
    pub target: String,
    /// Assets endpoint URL
    pub endpoint: String,
    /// Admin API access token, if the environment provided one
    pub token: Option<String>,
}

impl Destination {
    pub fn new(store: &str, theme_id: u64, target: &str) -> Self {
        let domain = if store.contains('.') {
            store.to_string()
        } else {
            format!("{}.myshopify.com", store.to_lowercase())
        };
        Self {
            id: DestinationId::new(&domain, theme_id),
            store: store.to_string(),
            endpoint: format!(
                "https://{}/admin/api/2023-04/themes/{}/assets.json",
                domain, theme_id
            ),
            domain,
            theme_id,
            target: target.to_string(),
            token: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// One ordered role matcher
#[derive(Debug, Clone)]
pub struct RoleMatcher {
    /// Matcher name as written in `[paths]`
    pub name: &'static str,
    pub role: Role,
    /// Output directory under the theme root
    pub output_dir: String,
    pub globs: Globs,
}

/// Runtime configuration resolved from CLI and config file
#[derive(Debug, Clone)]
pub struct Config {
    /// Project root; relative config paths resolve against it
    pub cwd: PathBuf,
    /// Source root (absolute)
    pub source: PathBuf,
    /// Theme output root (absolute)
    pub output: PathBuf,
    pub node_modules: PathBuf,
    /// Roots watched recursively (absolute)
    pub watch: Vec<PathBuf>,
    /// Ordered role matchers, first match wins
    pub matchers: Vec<RoleMatcher>,
    pub styles: Vec<Arc<StyleConfig>>,
    /// Post-processing chain file (absolute); absence disables the chain
    pub postcss: Option<PathBuf>,
    pub icons: IconsConfig,
    pub views: ViewsConfig,
    pub json: JsonConfig,
    pub queue: QueueConfig,
    pub watcher: WatcherConfig,
    pub destinations: Vec<Destination>,
    /// Enable verbose output
    pub verbose: bool,
}

impl Config {
    /// Create Config from CLI arguments, reading the config file if present
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = cli.cwd.canonicalize().unwrap_or_else(|_| cli.cwd.clone());
        let config_path = cwd.join(&cli.config);

        let file = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<FileConfig>(&raw).map_err(|e| SyncError::Config {
                message: format!("{}: {}", config_path.display(), e),
            })?
        } else {
            FileConfig::default()
        };

        let mut config = Self::resolve(cwd, file)?;
        config.verbose = cli.verbose;

        if let Command::Watch(WatchArgs {
            interval: Some(ms),
        }) = &cli.command
        {
            config.watcher.interval_ms = *ms;
        }

        Ok(config)
    }

    /// Parse TOML text and resolve it against `cwd`
    pub fn from_toml_str(cwd: &Path, raw: &str) -> Result<Self, SyncError> {
        let file = toml::from_str::<FileConfig>(raw).map_err(|e| SyncError::Config {
            message: e.to_string(),
        })?;
        Self::resolve(cwd.to_path_buf(), file)
    }

    /// Resolve raw config into absolute paths and compiled matchers
    pub fn resolve(cwd: PathBuf, file: FileConfig) -> Result<Self, SyncError> {
        let source_rel = file.source.unwrap_or_else(|| "source".to_string());
        let output_rel = file.output.unwrap_or_else(|| "theme".to_string());
        let node_modules = cwd.join(file.node_modules.as_deref().unwrap_or("node_modules"));

        let watch = file
            .watch
            .unwrap_or_else(|| vec![source_rel.clone()])
            .iter()
            .map(|w| cwd.join(w))
            .collect();

        let matchers = resolve_matchers(&file.paths, &source_rel)?;

        let mut styles = Vec::with_capacity(file.styles.compile.len());
        for style in file.styles.compile {
            let input = Path::new(&style.input);
            let watch = match style.watch {
                Some(globs) => globs,
                None => vec![default_style_watch(input)],
            };
            styles.push(Arc::new(StyleConfig {
                input: cwd.join(input),
                snippet: style.snippet,
                watch: compile_globs("styles.compile.watch", &watch)?,
                include: style.include.iter().map(|p| cwd.join(p)).collect(),
                node_modules: node_modules.clone(),
            }));
        }

        let mut sprites = Vec::with_capacity(file.icons.sprites.len());
        for sprite in file.icons.sprites {
            sprites.push(Arc::new(SpriteConfig {
                name: sprite.output,
                input: compile_globs("icons.sprites.input", &sprite.input)?,
                options: sprite.options,
            }));
        }
        let icons = IconsConfig {
            snippets: compile_globs("icons.snippets", &file.icons.snippets)?,
            sprites,
        };

        let destinations = file
            .destinations
            .iter()
            .map(|d| {
                let mut destination = Destination::new(&d.store, d.theme_id, &d.target);
                if let Some(endpoint) = &d.endpoint {
                    destination = destination.with_endpoint(endpoint.clone());
                }
                if let Ok(token) = std::env::var(&d.token_env) {
                    destination = destination.with_token(token);
                }
                destination
            })
            .collect();

        Ok(Config {
            source: cwd.join(&source_rel),
            output: cwd.join(&output_rel),
            node_modules,
            watch,
            matchers,
            styles,
            postcss: file.styles.postcss.map(|p| cwd.join(p)),
            icons,
            views: file.views,
            json: file.json,
            queue: file.queue,
            watcher: file.watcher,
            destinations,
            verbose: false,
            cwd,
        })
    }

    /// Path relative to the project root with forward slashes, as matched by globs
    pub fn relative(&self, path: &Path) -> String {
        crate::role::to_slash(path.strip_prefix(&self.cwd).unwrap_or(path))
    }
}

fn default_style_watch(input: &Path) -> String {
    match input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            format!("{}/**/*", crate::role::to_slash(parent))
        }
        _ => crate::role::to_slash(input),
    }
}

fn compile_globs(field: &str, patterns: &[String]) -> Result<Globs, SyncError> {
    Globs::new(patterns).map_err(|e| SyncError::Config {
        message: format!("{}: {}", field, e),
    })
}

fn resolve_matchers(paths: &PathsFile, source: &str) -> Result<Vec<RoleMatcher>, SyncError> {
    let defaults = |globs: &[&str]| -> Vec<String> {
        globs.iter().map(|g| format!("{}/{}", source, g)).collect()
    };

    let table: [(&'static str, &Option<Vec<String>>, Vec<String>); 9] = [
        ("assets", &paths.assets, defaults(&["assets/**/*"])),
        ("snippets", &paths.snippets, defaults(&["snippets/**/*.liquid"])),
        ("sections", &paths.sections, defaults(&["sections/**/*.liquid"])),
        ("layout", &paths.layout, defaults(&["layout/*.liquid"])),
        (
            "templates",
            &paths.templates,
            defaults(&["templates/*.liquid", "templates/*.json"]),
        ),
        (
            "customers",
            &paths.customers,
            defaults(&["templates/customers/*.liquid", "templates/customers/*.json"]),
        ),
        ("config", &paths.config, defaults(&["config/*.json"])),
        ("locales", &paths.locales, defaults(&["locales/*.json"])),
        ("metafields", &paths.metafields, defaults(&["metafields/**/*.json"])),
    ];

    let mut matchers = Vec::with_capacity(table.len());
    for (name, configured, fallback) in table {
        let role = Role::parse(name).ok_or_else(|| SyncError::Config {
            message: format!("unknown role matcher '{}'", name),
        })?;
        let output_dir = if name == "customers" {
            "templates/customers".to_string()
        } else {
            role.dir_name().to_string()
        };
        let globs = configured.as_ref().unwrap_or(&fallback);
        matchers.push(RoleMatcher {
            name,
            role,
            output_dir,
            globs: compile_globs(&format!("paths.{}", name), globs)?,
        });
    }

    Ok(matchers)
}
