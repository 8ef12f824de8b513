//! Inbound change notifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A change notification exactly as delivered by the change source.
///
/// `body` holds the canonical payload bytes the signature was computed
/// over; it must not be re-serialized before verification.
#[derive(Debug, Clone)]
pub struct RawNotification {
    /// Signature header value (lowercase hex HMAC-SHA256), if present.
    pub signature: Option<String>,
    /// Raw JSON body.
    pub body: Vec<u8>,
}

impl RawNotification {
    pub fn new(signature: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            signature: Some(signature.into()),
            body: body.into(),
        }
    }

    /// A notification that arrived without a signature header.
    pub fn unsigned(body: impl Into<Vec<u8>>) -> Self {
        Self {
            signature: None,
            body: body.into(),
        }
    }
}

/// One changed row: its key and the new field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDelta {
    pub row_key: String,
    /// Field name → new value. Ordered so hashing is deterministic.
    pub fields: BTreeMap<String, String>,
}

impl RowDelta {
    pub fn new(row_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field (builder pattern).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Non-blank value of a field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A verified change event.
///
/// Only rows that passed schema checks are kept in `rows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source: String,
    pub sequence: u64,
    pub signature: String,
    pub rows: Vec<RowDelta>,
}
