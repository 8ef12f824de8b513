//! Job record persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::errors::{StoreError, StoreResult};
use crate::models::{Job, JobStatus};

/// Durable storage for job records.
///
/// Job writes arrive from the registry's writer thread, one at a time and
/// in commit order, never under a registry lock. Implementations may block
/// but must not call back into the registry.
pub trait JobStore: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Option<Job>>;

    /// Insert or replace a record.
    fn put(&self, job: &Job) -> StoreResult<()>;

    fn list(&self) -> StoreResult<Vec<Job>>;

    fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|job| job.status == status)
            .collect())
    }

    /// Last accepted sequence per change source.
    fn load_watermarks(&self) -> StoreResult<HashMap<String, u64>> {
        Ok(HashMap::new())
    }

    fn save_watermarks(&self, _watermarks: &HashMap<String, u64>) -> StoreResult<()> {
        Ok(())
    }
}

/// Store that keeps records in memory only (tests, ephemeral runs).
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    watermarks: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        Ok(self.jobs.read().get(id).cloned())
    }

    fn put(&self, job: &Job) -> StoreResult<()> {
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<Job>> {
        Ok(self.jobs.read().values().cloned().collect())
    }

    fn load_watermarks(&self) -> StoreResult<HashMap<String, u64>> {
        Ok(self.watermarks.read().clone())
    }

    fn save_watermarks(&self, watermarks: &HashMap<String, u64>) -> StoreResult<()> {
        *self.watermarks.write() = watermarks.clone();
        Ok(())
    }
}

/// On-disk record format (one file per job).
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    /// Record format version.
    version: u32,
    job: Job,
}

const RECORD_VERSION: u32 = 1;

/// Watermark file kept next to the job records.
const WATERMARK_FILE: &str = "watermarks.json";

/// Store writing one pretty-printed JSON file per job.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// never leaves a half-written record.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes watermark saves; they share one temp file.
    watermark_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        Ok(Self {
            dir,
            watermark_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read_record(path: &Path) -> Option<Job> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read job record: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<JobRecord>(&content) {
            Ok(record) if record.version == RECORD_VERSION => Some(record.job),
            Ok(record) => {
                tracing::warn!(path = %path.display(), version = record.version, "Unsupported job record version");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to parse job record: {}", e);
                None
            }
        }
    }
}

impl JobStore for JsonFileStore {
    fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Self::read_record(&path))
    }

    fn put(&self, job: &Job) -> StoreResult<()> {
        let record = JobRecord {
            version: RECORD_VERSION,
            job: job.clone(),
        };
        let json = serde_json::to_string_pretty(&record).map_err(|e| StoreError::Encode {
            job_id: job.id.clone(),
            source: e,
        })?;

        let path = self.record_path(&job.id);
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, &json).map_err(|e| StoreError::io("write job record", e))?;
        fs::rename(&temp, &path).map_err(|e| StoreError::io("commit job record", e))?;

        tracing::trace!(job_id = %job.id, status = %job.status, "Persisted job record");
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<Job>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(format!("list {}", self.dir.display()), e))?;

        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| StoreError::io("read directory entry", e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(WATERMARK_FILE) {
                continue;
            }
            if let Some(job) = Self::read_record(&path) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    fn load_watermarks(&self) -> StoreResult<HashMap<String, u64>> {
        let path = self.dir.join(WATERMARK_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| StoreError::io("read watermarks", e))?;
        match serde_json::from_str(&content) {
            Ok(watermarks) => Ok(watermarks),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ignoring unreadable watermark file: {}", e);
                Ok(HashMap::new())
            }
        }
    }

    fn save_watermarks(&self, watermarks: &HashMap<String, u64>) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(watermarks).map_err(|e| StoreError::Encode {
            job_id: WATERMARK_FILE.to_string(),
            source: e,
        })?;
        let path = self.dir.join(WATERMARK_FILE);
        let temp = path.with_extension("json.tmp");
        let _writing = self.watermark_lock.lock();
        fs::write(&temp, &json).map_err(|e| StoreError::io("write watermarks", e))?;
        fs::rename(&temp, &path).map_err(|e| StoreError::io("commit watermarks", e))?;
        Ok(())
    }
}
