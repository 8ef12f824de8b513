//! Change validator: verification, replay protection and row parsing.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use super::errors::{IngestError, IngestResult, SchemaError};
use super::signature::SignatureVerifier;
use crate::config::IngestSettings;
use crate::models::{ChangeEvent, JobRequest, RawNotification, RowDelta, StageKind};

/// Row field listing the stages to run (comma-separated).
const STAGES_FIELD: &str = "stages";
/// Row field listing target platforms (comma-separated).
const PLATFORMS_FIELD: &str = "platforms";
/// Row field with the requested content length in seconds.
const DURATION_FIELD: &str = "duration_secs";

/// Wire format of a change notification body.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    source: String,
    sequence: u64,
    #[serde(default)]
    rows: Vec<WireRow>,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    #[serde(default)]
    row_key: Option<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Result of validating one notification.
#[derive(Debug, Clone)]
pub struct ValidatedChange {
    /// The verified event, holding only the rows that passed schema checks.
    pub event: ChangeEvent,
    /// One request per valid row, in row order.
    pub requests: Vec<JobRequest>,
    /// Rows that were skipped.
    pub schema_errors: Vec<SchemaError>,
}

/// Verifies and parses change notifications.
///
/// Owns the per-source sequence watermarks; they are only reachable through
/// this handle.
#[derive(Debug)]
pub struct ChangeValidator {
    verifier: SignatureVerifier,
    required_fields: Vec<String>,
    default_platforms: Vec<String>,
    watermarks: Mutex<HashMap<String, u64>>,
}

impl ChangeValidator {
    /// Create a validator with an explicit secret.
    pub fn new(secret: impl AsRef<[u8]>, settings: &IngestSettings) -> IngestResult<Self> {
        Ok(Self {
            verifier: SignatureVerifier::new(secret)?,
            required_fields: settings.required_fields.clone(),
            default_platforms: settings.default_platforms.clone(),
            watermarks: Mutex::new(HashMap::new()),
        })
    }

    /// Create a validator using the secret resolved from settings.
    pub fn from_settings(settings: &IngestSettings) -> IngestResult<Self> {
        let secret = settings
            .resolve_secret()
            .ok_or_else(|| IngestError::MissingSecret(settings.secret_env.clone()))?;
        Self::new(secret, settings)
    }

    /// The verifier used for incoming signatures.
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Last accepted sequence for a source.
    pub fn watermark(&self, source: &str) -> Option<u64> {
        self.watermarks.lock().get(source).copied()
    }

    /// Snapshot of every source watermark.
    pub fn watermarks(&self) -> HashMap<String, u64> {
        self.watermarks.lock().clone()
    }

    /// Hand the current watermarks to `save` while holding the watermark
    /// lock.
    ///
    /// Concurrent callers are serialized and each sees the newest marks, so
    /// the last save never carries an older sequence than an earlier one.
    pub fn persist_watermarks<E>(
        &self,
        save: impl FnOnce(&HashMap<String, u64>) -> Result<(), E>,
    ) -> Result<(), E> {
        let watermarks = self.watermarks.lock();
        save(&watermarks)
    }

    /// Seed watermarks (e.g. from a previous process). Never moves one back.
    pub fn restore_watermarks(&self, marks: impl IntoIterator<Item = (String, u64)>) {
        let mut watermarks = self.watermarks.lock();
        for (source, sequence) in marks {
            let entry = watermarks.entry(source).or_insert(sequence);
            *entry = (*entry).max(sequence);
        }
    }

    /// Validate one notification.
    ///
    /// The watermark advances as soon as the signature and envelope check
    /// out, before rows are parsed, so a replay is rejected even when some
    /// of its rows failed.
    pub fn validate(&self, raw: &RawNotification) -> IngestResult<ValidatedChange> {
        let signature = match raw.signature.as_deref() {
            Some(sig) if !sig.is_empty() => sig,
            _ => {
                tracing::warn!("Rejected change notification without signature");
                return Err(IngestError::authentication("missing signature"));
            }
        };

        if !self.verifier.verify(&raw.body, signature) {
            tracing::warn!(bytes = raw.body.len(), "Rejected change notification with bad signature");
            return Err(IngestError::authentication("signature mismatch"));
        }

        let envelope: WireEnvelope = serde_json::from_slice(&raw.body).map_err(|e| {
            tracing::warn!("Signed notification is not a valid envelope: {}", e);
            IngestError::malformed(e.to_string())
        })?;

        self.advance_watermark(&envelope.source, envelope.sequence)?;

        let mut rows = Vec::with_capacity(envelope.rows.len());
        let mut requests = Vec::with_capacity(envelope.rows.len());
        let mut schema_errors = Vec::new();

        for (index, wire_row) in envelope.rows.into_iter().enumerate() {
            match self.parse_row(&envelope.source, index, wire_row) {
                Ok((row, request)) => {
                    rows.push(row);
                    requests.push(request);
                }
                Err(err) => {
                    tracing::warn!(source = %envelope.source, sequence = envelope.sequence, "Skipping row: {}", err);
                    schema_errors.push(err);
                }
            }
        }

        tracing::info!(
            source = %envelope.source,
            sequence = envelope.sequence,
            valid = requests.len(),
            rejected = schema_errors.len(),
            "Accepted change notification"
        );

        Ok(ValidatedChange {
            event: ChangeEvent {
                source: envelope.source,
                sequence: envelope.sequence,
                signature: signature.to_string(),
                rows,
            },
            requests,
            schema_errors,
        })
    }

    /// Check-and-set of the source watermark under one lock.
    fn advance_watermark(&self, source: &str, sequence: u64) -> IngestResult<()> {
        let mut watermarks = self.watermarks.lock();
        if let Some(&watermark) = watermarks.get(source) {
            if sequence <= watermark {
                tracing::debug!(source, sequence, watermark, "Discarding replayed or stale event");
                return Err(IngestError::DuplicateOrOutOfOrder {
                    source_id: source.to_string(),
                    sequence,
                    watermark,
                });
            }
        }
        watermarks.insert(source.to_string(), sequence);
        Ok(())
    }

    fn parse_row(
        &self,
        source: &str,
        index: usize,
        wire: WireRow,
    ) -> Result<(RowDelta, JobRequest), SchemaError> {
        let row_key = match wire.row_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(SchemaError::new(index, "", "missing row_key")),
        };

        let fields: BTreeMap<String, String> = wire
            .fields
            .into_iter()
            .filter_map(|(name, value)| field_to_string(value).map(|v| (name, v)))
            .collect();
        let row = RowDelta {
            row_key: row_key.clone(),
            fields,
        };

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|name| row.field(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::missing_fields(index, &row_key, &missing));
        }

        let stages = match row.field(STAGES_FIELD) {
            Some(list) => parse_stages(list).map_err(|m| SchemaError::new(index, &row_key, m))?,
            None => StageKind::ALL.to_vec(),
        };

        let platforms = match row.field(PLATFORMS_FIELD) {
            Some(list) => split_list(list),
            None => Vec::new(),
        };
        let platforms = if platforms.is_empty() {
            self.default_platforms.clone()
        } else {
            platforms
        };

        let duration = match row.field(DURATION_FIELD) {
            Some(value) => Some(value.parse::<u32>().map_err(|_| {
                SchemaError::new(index, &row_key, format!("invalid {}: '{}'", DURATION_FIELD, value))
            })?),
            None => None,
        };

        let mut request = JobRequest::new(source, &row_key, row.fields.clone(), stages, platforms);
        request.target_duration_secs = duration;
        Ok((row, request))
    }
}

/// Cell values arrive as JSON scalars; nulls count as absent.
fn field_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(field_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

fn split_list(list: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in list.split(',') {
        let item = item.trim().to_ascii_lowercase();
        if !item.is_empty() && !items.contains(&item) {
            items.push(item);
        }
    }
    items
}

/// Parse a stage list into canonical pipeline order, dropping repeats.
fn parse_stages(list: &str) -> Result<Vec<StageKind>, String> {
    let mut stages = split_list(list)
        .iter()
        .map(|s| s.parse::<StageKind>())
        .collect::<Result<Vec<_>, _>>()?;
    if stages.is_empty() {
        return Err("empty stage list".to_string());
    }
    stages.sort();
    stages.dedup();
    Ok(stages)
}
