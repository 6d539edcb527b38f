//! Liquid/HTML view minifier.

use regex::Regex;

use crate::config::ViewMinifyConfig;
use crate::error::SyncError;

/// Compiled view minifier. Regexes are built once and shared across files
#[derive(Debug, Clone)]
pub struct ViewTransform {
    config: ViewMinifyConfig,
    html_comment: Regex,
    liquid_comment: Regex,
    protected: Regex,
    schema: Regex,
    block_tag: Regex,
    whitespace: Regex,
}

impl ViewTransform {
    pub fn new(config: ViewMinifyConfig) -> Result<Self, SyncError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| SyncError::Config {
                message: format!("views.minify: {}", e),
            })
        };

        Ok(Self {
            html_comment: compile(r"(?s)<!--.*?-->")?,
            liquid_comment: compile(
                r"(?s)\{%-?\s*comment\s*-?%\}.*?\{%-?\s*endcomment\s*-?%\}",
            )?,
            protected: compile(concat!(
                r"(?is)<pre\b.*?</pre\s*>",
                r"|<textarea\b.*?</textarea\s*>",
                r"|<script\b.*?</script\s*>",
                r"|<style\b.*?</style\s*>",
                r"|\{%-?\s*raw\s*-?%\}.*?\{%-?\s*endraw\s*-?%\}",
                r"|\{%-?\s*schema\s*-?%\}.*?\{%-?\s*endschema\s*-?%\}",
                r"|\{\{.*?\}\}",
                r"|\{%.*?%\}",
            ))?,
            schema: compile(
                r"(?s)^(\{%-?\s*schema\s*-?%\})(.*?)(\{%-?\s*endschema\s*-?%\})$",
            )?,
            block_tag: compile(concat!(
                r"(?i)\s*(</?(?:address|article|aside|blockquote|body|dd|details|div|dl|dt",
                r"|fieldset|figcaption|figure|footer|form|h[1-6]|head|header|hr|html|li|link",
                r"|main|meta|nav|ol|p|section|summary|table|tbody|td|tfoot|th|thead|title|tr|ul)",
                r"\b[^>]*>)\s*",
            ))?,
            whitespace: compile(r"\s+")?,
            config,
        })
    }

    /// True when `relative` would be minified
    pub fn applies_to(&self, relative: &str) -> bool {
        self.config.apply && !self.config.exclude.matches(relative)
    }

    /// Minify one view. Files outside the minify scope pass through byte-for-byte
    pub fn transform(&self, relative: &str, source: &[u8]) -> Result<Vec<u8>, SyncError> {
        if !self.applies_to(relative) {
            return Ok(source.to_vec());
        }

        let text = std::str::from_utf8(source)
            .map_err(|e| SyncError::compile(relative, format!("view is not UTF-8: {}", e)))?;

        Ok(self.minify(relative, text)?.into_bytes())
    }

    /// Minify view text, leaving protected regions (preformatted elements,
    /// scripts, styles, raw and schema blocks, Liquid output and tags) untouched
    pub fn minify(&self, relative: &str, text: &str) -> Result<String, SyncError> {
        let text = if self.config.remove_liquid_comments {
            self.liquid_comment.replace_all(text, "")
        } else {
            text.into()
        };

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for region in self.protected.find_iter(&text) {
            out.push_str(&self.minify_free(&text[last..region.start()]));
            out.push_str(&self.protected_region(relative, region.as_str())?);
            last = region.end();
        }
        out.push_str(&self.minify_free(&text[last..]));

        Ok(out.trim().to_string())
    }

    fn minify_free(&self, segment: &str) -> String {
        let mut segment = if self.config.remove_comments {
            self.html_comment.replace_all(segment, "").into_owned()
        } else {
            segment.to_string()
        };

        if self.config.collapse_whitespace {
            // Whitespace next to block-level tags never renders; elsewhere one space is kept
            segment = self.block_tag.replace_all(&segment, "$1").into_owned();
            segment = self.whitespace.replace_all(&segment, " ").into_owned();
        }

        segment
    }

    fn protected_region(&self, relative: &str, region: &str) -> Result<String, SyncError> {
        if !self.config.minify_section_schema {
            return Ok(region.to_string());
        }

        let Some(caps) = self.schema.captures(region) else {
            return Ok(region.to_string());
        };

        let value: serde_json::Value = serde_json::from_str(&caps[2])
            .map_err(|e| SyncError::compile(relative, format!("invalid section schema: {}", e)))?;

        Ok(format!("{}{}{}", &caps[1], value, &caps[3]))
    }
}
