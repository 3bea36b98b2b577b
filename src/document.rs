//! Structured documents observed by the platform.
//!
//! JSON image labels are navigated with slash-delimited paths
//! (`lifecycle/apis/platform/supported`). TOML documents written by builders
//! and by the lifecycle itself (`run.toml`, `analyzed.toml`) are read into
//! typed structures.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// JSON Labels
// =============================================================================

/// Parses a JSON label value.
pub fn parse_json(what: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::document(what, e))
}

/// Walks `path` (slash-delimited object keys) from `root`.
pub fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| node.get(segment))
}

/// Reads a string at `path`.
pub fn string_at(root: &Value, path: &str) -> Option<String> {
    value_at(root, path)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Reads an array of strings at `path`, skipping non-string members.
pub fn string_array_at(root: &Value, path: &str) -> Option<Vec<String>> {
    value_at(root, path).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// True when a label value carries content: not blank, and not an empty
/// JSON object/array/null.
pub fn label_has_content(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => !map.is_empty(),
        Ok(Value::Array(items)) => !items.is_empty(),
        Ok(Value::Null) => false,
        Ok(_) | Err(_) => true,
    }
}

// =============================================================================
// TOML Documents
// =============================================================================

/// `/cnb/run.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunMetadata {
    #[serde(default)]
    pub images: Vec<RunImageEntry>,
}

/// One `[[images]]` table in `run.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunImageEntry {
    pub image: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl RunMetadata {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::document("run.toml", e))
    }

    /// Image names in declaration order.
    pub fn image_names(&self) -> Vec<String> {
        self.images.iter().map(|entry| entry.image.clone()).collect()
    }
}

/// The lifecycle's analyzed document (`analyzed.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzedMetadata {
    #[serde(rename = "run-image", default)]
    pub run_image: Option<AnalyzedRunImage>,
}

/// `[run-image]` table in `analyzed.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzedRunImage {
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extend: bool,
}

impl AnalyzedMetadata {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::document("analyzed.toml", e))
    }

    /// `run-image.reference`, if present and non-blank.
    pub fn run_image_reference(&self) -> Option<&str> {
        self.run_image
            .as_ref()
            .and_then(|r| r.reference.as_deref())
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    /// `run-image.extend`, defaulting to false.
    pub fn run_image_extend(&self) -> bool {
        self.run_image.as_ref().is_some_and(|r| r.extend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_at_walks_nested_objects() {
        let doc = parse_json(
            "metadata",
            r#"{"lifecycle":{"apis":{"platform":{"supported":["0.9","0.12"]}}},"stack":{"runImage":{"image":"run:base"}}}"#,
        )
        .unwrap();
        assert_eq!(
            string_array_at(&doc, "lifecycle/apis/platform/supported").unwrap(),
            ["0.9", "0.12"]
        );
        assert_eq!(string_at(&doc, "stack/runImage/image").unwrap(), "run:base");
        assert!(value_at(&doc, "stack/missing/image").is_none());
    }

    #[test]
    fn test_label_has_content() {
        assert!(!label_has_content(""));
        assert!(!label_has_content("  {} "));
        assert!(!label_has_content("null"));
        assert!(label_has_content(r#"{"ext/id":{"1.0":{}}}"#));
    }

    #[test]
    fn test_run_toml_images() {
        let meta = RunMetadata::parse(
            "[[images]]\nimage = \"run:a\"\nmirrors = [\"m/run:a\"]\n\n[[images]]\nimage = \"run:b\"\n",
        )
        .unwrap();
        assert_eq!(meta.image_names(), ["run:a", "run:b"]);
    }

    #[test]
    fn test_analyzed_document_defaults() {
        let meta = AnalyzedMetadata::parse("[run-image]\nreference = \"custom/run:1\"\n").unwrap();
        assert_eq!(meta.run_image_reference(), Some("custom/run:1"));
        assert!(!meta.run_image_extend());

        let meta = AnalyzedMetadata::parse("[run-image]\nreference = \"r\"\nextend = true\n").unwrap();
        assert!(meta.run_image_extend());

        let empty = AnalyzedMetadata::parse("").unwrap();
        assert_eq!(empty.run_image_reference(), None);
    }
}
