//! Job requests: candidate units of work awaiting admission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::enums::{ResourceClass, StageKind};

/// A candidate job derived from one validated row (or submitted directly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Deterministic key: source + row key + content hash.
    pub idempotency_key: String,
    /// Change source the request came from (per-source slots are keyed on it).
    pub source: String,
    pub row_key: String,
    pub title: String,
    /// Stages to run, in execution order.
    pub stages: Vec<StageKind>,
    /// Platforms the final content is adapted for.
    pub platforms: Vec<String>,
    /// Requested content length, if the row specified one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_duration_secs: Option<u32>,
    /// Row fields handed to the generators as input.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl JobRequest {
    /// Build a request and derive its idempotency key from the content.
    pub fn new(
        source: impl Into<String>,
        row_key: impl Into<String>,
        fields: BTreeMap<String, String>,
        stages: Vec<StageKind>,
        platforms: Vec<String>,
    ) -> Self {
        let source = source.into();
        let row_key = row_key.into();
        let key = idempotency_key(&source, &row_key, &fields);
        let title = fields.get("title").cloned().unwrap_or_default();
        Self {
            idempotency_key: key,
            source,
            row_key,
            title,
            stages,
            platforms,
            target_duration_secs: None,
            fields,
        }
    }

    /// Set the target duration (builder pattern).
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.target_duration_secs = Some(secs);
        self
    }

    /// Heaviest resource class among the requested stages.
    pub fn resource_class(&self) -> ResourceClass {
        ResourceClass::for_stages(&self.stages)
    }
}

/// Derive the idempotency key for a row.
///
/// SHA-256 over the source, the row key and a content hash of the fields.
/// Fields are hashed in key order so the result does not depend on how the
/// change source ordered them.
pub fn idempotency_key(source: &str, row_key: &str, fields: &BTreeMap<String, String>) -> String {
    let mut content = Sha256::new();
    for (name, value) in fields {
        content.update(name.as_bytes());
        content.update([0x1f]);
        content.update(value.as_bytes());
        content.update([0x1e]);
    }
    let content_hash = content.finalize();

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0]);
    hasher.update(row_key.as_bytes());
    hasher.update([0]);
    hasher.update(content_hash);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn key_is_deterministic() {
        let f = fields(&[("title", "A"), ("description", "B")]);
        assert_eq!(
            idempotency_key("sheet-1", "row-7", &f),
            idempotency_key("sheet-1", "row-7", &f)
        );
        assert_eq!(idempotency_key("s", "r", &f).len(), 64);
    }

    #[test]
    fn key_changes_with_content_row_and_source() {
        let a = fields(&[("title", "A")]);
        let b = fields(&[("title", "B")]);
        let base = idempotency_key("s", "r", &a);

        assert_ne!(base, idempotency_key("s", "r", &b));
        assert_ne!(base, idempotency_key("s", "r2", &a));
        assert_ne!(base, idempotency_key("s2", "r", &a));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = fields(&[("ab", "c")]);
        let b = fields(&[("a", "bc")]);
        assert_ne!(idempotency_key("s", "r", &a), idempotency_key("s", "r", &b));
    }

    #[test]
    fn new_request_takes_title_from_fields() {
        let req = JobRequest::new(
            "sheet",
            "row-1",
            fields(&[("title", "Intro")]),
            vec![StageKind::Script, StageKind::Video],
            vec!["youtube".to_string()],
        );
        assert_eq!(req.title, "Intro");
        assert_eq!(req.resource_class(), ResourceClass::Video);
        assert!(req.target_duration_secs.is_none());
    }
}
