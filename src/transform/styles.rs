//! SASS and CSS compilation.
//!
//! SCSS entries are compiled with `grass` (compressed, non-indented syntax)
//! through a filesystem shim that resolves `~package/partial` imports under
//! the configured node_modules directory. The compiled CSS, or raw CSS for
//! plain stylesheets, then runs through the optional post-processing chain
//! and is finally wrapped in `<style>` tags for snippet outputs.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::StyleConfig;
use crate::error::SyncError;
use crate::role::{to_slash, FileDescriptor, StyleSyntax};
use crate::transform::postcss::{PostProcessor, ProcessOptions};

/// Stylesheet transform. Owns the shared post-processing chain
#[derive(Debug, Clone, Default)]
pub struct StyleTransform {
    postcss: Option<Arc<PostProcessor>>,
}

impl StyleTransform {
    pub fn new(postcss: Option<Arc<PostProcessor>>) -> Self {
        Self { postcss }
    }

    pub fn has_postcss(&self) -> bool {
        self.postcss.is_some()
    }

    /// Compile one stylesheet entry into its output bytes
    pub fn compile(
        &self,
        file: &FileDescriptor,
        syntax: StyleSyntax,
        config: &StyleConfig,
        source: &str,
    ) -> Result<Vec<u8>, SyncError> {
        let css = match (syntax, &self.postcss) {
            (StyleSyntax::Scss, None) => sass(config, source)?,
            (StyleSyntax::Scss, Some(chain)) => postprocess(chain, file, &sass(config, source)?)?,
            (StyleSyntax::Css, Some(chain)) => postprocess(chain, file, source)?,
            (StyleSyntax::Css, None) => source.to_string(),
        };

        Ok(snippet(config.snippet, css))
    }
}

/// Wrap CSS in `<style>` tags for inline snippets
pub fn snippet(is_snippet: bool, css: String) -> Vec<u8> {
    if is_snippet {
        format!("<style>{}</style>", css).into_bytes()
    } else {
        css.into_bytes()
    }
}

/// Compile SCSS source for `config.input` to compressed CSS.
///
/// grass has no source map output, so no map is produced here and none is
/// handed to the post-processing chain.
pub fn sass(config: &StyleConfig, source: &str) -> Result<String, SyncError> {
    let importer = TildeImporter::new(&config.node_modules);

    let mut options = grass::Options::default()
        .style(grass::OutputStyle::Compressed)
        .input_syntax(grass::InputSyntax::Scss)
        .load_paths(config.include.as_slice())
        .fs(&importer);
    if let Some(parent) = config.input.parent() {
        options = options.load_path(parent);
    }

    let result = grass::from_string(source.to_string(), &options);

    for specifier in importer.unresolved() {
        warn!(
            input = %config.input.display(),
            node_modules = %config.node_modules.display(),
            "could not resolve ~{} under node_modules, falling back to default resolution",
            specifier
        );
    }

    result.map_err(|e| SyncError::compile(&config.input, e))
}

fn postprocess(
    chain: &PostProcessor,
    file: &FileDescriptor,
    css: &str,
) -> Result<String, SyncError> {
    let processed = chain
        .process(
            css,
            ProcessOptions {
                to: &file.output_path,
            },
        )
        .map_err(|e| SyncError::compile(&file.source_path, e))?;

    for warning in &processed.warnings {
        warn!(path = %file.source_path.display(), "{}", warning);
    }

    Ok(processed.css)
}

/// Filesystem shim for the SASS compiler. Any probed path with a component
/// starting with `~` is looked up under node_modules first; a miss falls
/// through to the real path so default resolution still runs
#[derive(Debug)]
pub struct TildeImporter {
    node_modules: PathBuf,
    probed: Mutex<BTreeSet<String>>,
    resolved: Mutex<BTreeSet<String>>,
}

impl TildeImporter {
    pub fn new(node_modules: &Path) -> Self {
        Self {
            node_modules: node_modules.to_path_buf(),
            probed: Mutex::new(BTreeSet::new()),
            resolved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Map `.../~pkg/partial.scss` to `node_modules/pkg/partial.scss`
    pub fn rewrite(&self, path: &Path) -> Option<(String, PathBuf)> {
        let components: Vec<Component<'_>> = path.components().collect();
        let index = components
            .iter()
            .position(|c| c.as_os_str().to_string_lossy().starts_with('~'))?;

        let mut rest = PathBuf::new();
        for (i, component) in components[index..].iter().enumerate() {
            let part = component.as_os_str().to_string_lossy();
            if i == 0 {
                rest.push(part.trim_start_matches('~'));
            } else {
                rest.push(part.as_ref());
            }
        }

        Some((specifier(&rest), self.node_modules.join(rest)))
    }

    /// Tilde specifiers probed without any node_modules hit
    pub fn unresolved(&self) -> Vec<String> {
        let probed = self.probed.lock().map(|s| s.clone()).unwrap_or_default();
        let resolved = self.resolved.lock().map(|s| s.clone()).unwrap_or_default();
        probed.difference(&resolved).cloned().collect()
    }

    fn record(set: &Mutex<BTreeSet<String>>, specifier: &str) {
        if let Ok(mut set) = set.lock() {
            set.insert(specifier.to_string());
        }
    }

    fn locate(&self, path: &Path) -> PathBuf {
        match self.rewrite(path) {
            Some((specifier, candidate)) => {
                Self::record(&self.probed, &specifier);
                if candidate.is_file() {
                    Self::record(&self.resolved, &specifier);
                    candidate
                } else {
                    path.to_path_buf()
                }
            }
            None => path.to_path_buf(),
        }
    }
}

impl grass::Fs for TildeImporter {
    fn is_dir(&self, path: &Path) -> bool {
        match self.rewrite(path) {
            Some((_, candidate)) if candidate.is_dir() => true,
            _ => path.is_dir(),
        }
    }

    fn is_file(&self, path: &Path) -> bool {
        self.locate(path).is_file()
    }

    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.locate(path))
    }
}

/// Normalize a probed import to the specifier the stylesheet wrote:
/// no extension, no partial underscore, no trailing index file
fn specifier(rest: &Path) -> String {
    let mut path = rest.with_extension("");
    if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
        let name = name.trim_start_matches('_');
        if name == "index" {
            path.pop();
        } else {
            path.set_file_name(name);
        }
    }
    to_slash(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Globs;
    use crate::role::{AssetKey, Role, RoleConfig};
    use crate::transform::postcss::{Banner, Plugin, PluginError};
    use std::fs;
    use tempfile::TempDir;

    fn style_config(root: &Path, input: &str, snippet: bool) -> StyleConfig {
        StyleConfig {
            input: root.join(input),
            snippet,
            watch: Globs::default(),
            include: Vec::new(),
            node_modules: root.join("node_modules"),
        }
    }

    fn descriptor(root: &Path, config: &StyleConfig) -> FileDescriptor {
        FileDescriptor {
            observed_path: config.input.clone(),
            source_path: config.input.clone(),
            output_path: root.join("theme/assets/main.css"),
            key: AssetKey::new("assets/main.css"),
            role: Role::Asset,
            config: RoleConfig::Passthrough,
        }
    }

    #[derive(Debug)]
    struct Identity;

    impl Plugin for Identity {
        fn name(&self) -> &str {
            "identity"
        }

        fn process(&self, css: String, _w: &mut Vec<String>) -> Result<String, PluginError> {
            Ok(css)
        }
    }

    // ==================== sass tests ====================

    #[test]
    fn test_sass_compressed_output() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);

        let css = sass(&config, "$c: red;\n.a {\n  color: $c;\n}\n").unwrap();

        assert_eq!(css.trim(), ".a{color:red}");
        assert!(!css.contains("sourceMappingURL"));
    }

    #[test]
    fn test_sass_tilde_import_resolves_node_modules() {
        let temp = TempDir::new().unwrap();
        let partial = temp.path().join("node_modules/foo");
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("partial.scss"), ".from-foo { margin: 0; }").unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);

        let css = sass(&config, "@import \"~foo/partial\";\n.b { color: blue; }").unwrap();

        assert!(css.contains(".from-foo{margin:0}"));
        assert!(css.contains(".b{color:blue}"));
    }

    #[test]
    fn test_sass_relative_import_from_input_dir() {
        let temp = TempDir::new().unwrap();
        let styles = temp.path().join("styles");
        fs::create_dir_all(&styles).unwrap();
        fs::write(styles.join("_vars.scss"), "$gap: 4px;").unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);

        let css = sass(&config, "@import \"vars\";\n.c { padding: $gap; }").unwrap();

        assert!(css.contains(".c{padding:4px}"));
    }

    #[test]
    fn test_sass_syntax_error() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);

        let result = sass(&config, ".a { color: ");

        assert!(matches!(result, Err(SyncError::Compile { .. })));
    }

    #[test]
    fn test_sass_unresolved_tilde_import_fails() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);

        let result = sass(&config, "@import \"~missing/partial\";");

        assert!(result.is_err());
    }

    // ==================== TildeImporter tests ====================

    #[test]
    fn test_rewrite_tilde_component() {
        let importer = TildeImporter::new(Path::new("/work/node_modules"));
        let (spec, path) = importer
            .rewrite(Path::new("/work/styles/~foo/_partial.scss"))
            .unwrap();
        assert_eq!(spec, "foo/partial");
        assert_eq!(path, PathBuf::from("/work/node_modules/foo/_partial.scss"));
    }

    #[test]
    fn test_rewrite_plain_path_is_none() {
        let importer = TildeImporter::new(Path::new("/work/node_modules"));
        assert!(importer.rewrite(Path::new("/work/styles/vars.scss")).is_none());
    }

    #[test]
    fn test_specifier_strips_index() {
        assert_eq!(specifier(Path::new("pkg/_index.scss")), "pkg");
        assert_eq!(specifier(Path::new("pkg/grid/_cols.scss")), "pkg/grid/cols");
    }

    #[test]
    fn test_unresolved_tracks_misses_only() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("node_modules/hit")).unwrap();
        fs::write(temp.path().join("node_modules/hit/a.scss"), "").unwrap();
        let importer = TildeImporter::new(&temp.path().join("node_modules"));

        assert!(grass::Fs::is_file(&importer, Path::new("~hit/a.scss")));
        assert!(!grass::Fs::is_file(&importer, Path::new("~miss/b.scss")));

        assert_eq!(importer.unresolved(), vec!["miss/b".to_string()]);
    }

    // ==================== compile tests ====================

    #[test]
    fn test_compile_scss_without_postcss_equals_raw_compile() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);
        let file = descriptor(temp.path(), &config);
        let source = ".a { .b { color: red; } }";

        let bytes = StyleTransform::new(None)
            .compile(&file, StyleSyntax::Scss, &config, source)
            .unwrap();

        assert_eq!(bytes, sass(&config, source).unwrap().into_bytes());
    }

    #[test]
    fn test_compile_noop_chain_preserves_output() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/main.scss", false);
        let file = descriptor(temp.path(), &config);
        let source = ".a { color: red; }";
        let chain = Arc::new(PostProcessor::new(vec![Box::new(Identity)]));

        let plain = StyleTransform::new(None)
            .compile(&file, StyleSyntax::Scss, &config, source)
            .unwrap();
        let chained = StyleTransform::new(Some(chain))
            .compile(&file, StyleSyntax::Scss, &config, source)
            .unwrap();

        assert_eq!(plain, chained);
    }

    #[test]
    fn test_compile_css_runs_postcss() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/base.css", false);
        let file = descriptor(temp.path(), &config);
        let chain = Arc::new(PostProcessor::new(vec![Box::new(Banner {
            text: "/*! b */".to_string(),
        })]));

        let bytes = StyleTransform::new(Some(chain))
            .compile(&file, StyleSyntax::Css, &config, "a { color: red; }")
            .unwrap();

        assert_eq!(String::from_utf8(bytes).unwrap(), "/*! b */a { color: red; }");
    }

    #[test]
    fn test_compile_css_passthrough_without_postcss() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/base.css", false);
        let file = descriptor(temp.path(), &config);

        let bytes = StyleTransform::new(None)
            .compile(&file, StyleSyntax::Css, &config, "a { color: red; }")
            .unwrap();

        assert_eq!(bytes, b"a { color: red; }".to_vec());
    }

    #[test]
    fn test_compile_snippet_wraps_style_tags() {
        let temp = TempDir::new().unwrap();
        let config = style_config(temp.path(), "styles/critical.css", true);
        let file = descriptor(temp.path(), &config);

        let bytes = StyleTransform::new(None)
            .compile(&file, StyleSyntax::Css, &config, "a{b:c}")
            .unwrap();

        assert_eq!(bytes, b"<style>a{b:c}</style>".to_vec());
    }

    #[test]
    fn test_snippet_passthrough() {
        assert_eq!(snippet(false, "x{}".to_string()), b"x{}".to_vec());
    }
}
