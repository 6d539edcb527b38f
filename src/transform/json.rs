//! JSON documents: comment stripping, validation and optional minify.

use std::borrow::Cow;

use serde_json::Value;

use crate::config::JsonConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Default)]
pub struct JsonTransform {
    config: JsonConfig,
}

impl JsonTransform {
    pub fn new(config: JsonConfig) -> Self {
        Self { config }
    }

    /// True when `relative` is re-serialized compactly
    pub fn minifies(&self, relative: &str) -> bool {
        self.config.minify.apply && !self.config.minify.exclude.matches(relative)
    }

    pub fn transform(&self, relative: &str, source: &[u8]) -> Result<Vec<u8>, SyncError> {
        let text = std::str::from_utf8(source)
            .map_err(|e| SyncError::compile(relative, format!("JSON is not UTF-8: {}", e)))?;

        let text = if self.config.allow_comments {
            strip_comments(text)
        } else {
            Cow::Borrowed(text)
        };

        let mut value: Value = serde_json::from_str(&text)
            .map_err(|e| SyncError::compile(relative, format!("invalid JSON: {}", e)))?;

        if !self.minifies(relative) {
            return Ok(match text {
                Cow::Borrowed(_) => source.to_vec(),
                Cow::Owned(stripped) => stripped.into_bytes(),
            });
        }

        if self.config.minify.remove_schema_refs {
            if let Some(object) = value.as_object_mut() {
                object.retain(|key, _| key != "$schema");
            }
        }

        serde_json::to_vec(&value).map_err(|e| SyncError::compile(relative, e))
    }
}

/// Remove `//` and `/* */` comments outside string literals
pub fn strip_comments(text: &str) -> Cow<'_, str> {
    if !text.contains("//") && !text.contains("/*") {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => {
                out.push_str(&text[start..i]);
                let end = text[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len());
                start = end;
                i = end;
                continue;
            }
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'*') => {
                out.push_str(&text[start..i]);
                let end = text[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                start = end;
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    out.push_str(&text[start.min(text.len())..]);

    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Globs, JsonMinifyConfig};

    fn minifying(remove_schema_refs: bool) -> JsonTransform {
        JsonTransform::new(JsonConfig {
            allow_comments: true,
            minify: JsonMinifyConfig {
                apply: true,
                remove_schema_refs,
                exclude: Globs::new(&["source/locales/*"]).unwrap(),
            },
        })
    }

    // ==================== strip_comments tests ====================

    #[test]
    fn test_strip_comments_outside_strings() {
        let text = "{\n  // line\n  \"url\": \"http://x/*y*/\", /* block */ \"a\": 1\n}";
        let stripped = strip_comments(text);
        assert_eq!(stripped, "{\n  \n  \"url\": \"http://x/*y*/\",  \"a\": 1\n}");
    }

    #[test]
    fn test_strip_comments_borrows_when_clean() {
        assert!(matches!(strip_comments("{\"a\":1}"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_comments_escaped_quote() {
        let text = r#"{"a": "say \"//hi\""} // tail"#;
        assert_eq!(strip_comments(text), r#"{"a": "say \"//hi\""} "#);
    }

    // ==================== transform tests ====================

    #[test]
    fn test_clean_json_passes_through_bytes() {
        let source = b"{\n  \"sections\": {}\n}\n";
        let out = JsonTransform::default()
            .transform("source/templates/index.json", source)
            .unwrap();
        assert_eq!(out, source.to_vec());
    }

    #[test]
    fn test_comments_rejected_when_not_allowed() {
        let transform = JsonTransform::new(JsonConfig {
            allow_comments: false,
            ..Default::default()
        });
        let result = transform.transform("a.json", b"{ /* x */ }");
        assert!(matches!(result, Err(SyncError::Compile { .. })));
    }

    #[test]
    fn test_invalid_json_is_compile_error() {
        let result = JsonTransform::default().transform("a.json", b"{\"a\": }");
        assert!(matches!(result, Err(SyncError::Compile { .. })));
    }

    #[test]
    fn test_minify_preserves_key_order() {
        let out = minifying(false)
            .transform("source/config/settings_schema.json", b"{ \"z\": 1,\n \"a\": [1, 2] }")
            .unwrap();
        assert_eq!(out, b"{\"z\":1,\"a\":[1,2]}".to_vec());
    }

    #[test]
    fn test_minify_removes_schema_ref() {
        let out = minifying(true)
            .transform(
                "source/templates/index.json",
                b"{\"$schema\": \"x.json\", \"b\": 1, \"c\": 2}",
            )
            .unwrap();
        assert_eq!(out, b"{\"b\":1,\"c\":2}".to_vec());
    }

    #[test]
    fn test_minify_exclude() {
        let transform = minifying(true);
        assert!(!transform.minifies("source/locales/en.default.json"));
        let out = transform
            .transform("source/locales/en.default.json", b"{ \"a\": 1 }")
            .unwrap();
        assert_eq!(out, b"{ \"a\": 1 }".to_vec());
    }
}
