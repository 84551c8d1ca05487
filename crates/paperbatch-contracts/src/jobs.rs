use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const RECORD_PREFIX: &str = "batch_job_";
pub const RECORD_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Submitted
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// One durable record per submitted batch job. Created at submission time,
/// mutated once when images are materialized, never deleted by the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub status: JobStatus,
    pub prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u64>,
}

impl JobRecord {
    pub fn safe_id(&self) -> anyhow::Result<String> {
        sanitize_job_id(&self.job_id)
    }
}

/// Filesystem-safe identifier: the trailing path segment of the vendor's
/// opaque job name. Segments that are empty or still carry separator or
/// traversal sequences are rejected rather than used in any path.
pub fn sanitize_job_id(job_id: &str) -> anyhow::Result<String> {
    let segment = job_id.rsplit('/').next().unwrap_or_default().trim();
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        bail!("job id {job_id:?} has no filesystem-safe segment");
    }
    Ok(segment.to_string())
}

#[derive(Debug, Clone)]
pub struct JobLedger {
    root: PathBuf,
}

impl JobLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, job_id: &str) -> anyhow::Result<PathBuf> {
        let safe_id = sanitize_job_id(job_id)?;
        Ok(self
            .root
            .join(format!("{RECORD_PREFIX}{safe_id}{RECORD_SUFFIX}")))
    }

    pub fn create(
        &self,
        job_id: &str,
        theme: &str,
        prompts: Vec<String>,
    ) -> anyhow::Result<JobRecord> {
        let record = JobRecord {
            job_id: job_id.to_string(),
            theme: theme.to_string(),
            timestamp: epoch_seconds(),
            status: JobStatus::Submitted,
            prompts,
            image_count: None,
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Scans the ledger root for record files. Corrupt or partial files are
    /// skipped, not fatal. Newest first; records without a timestamp sort last.
    pub fn list(&self) -> Vec<JobRecord> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(RECORD_PREFIX) || !name.ends_with(RECORD_SUFFIX) {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            if let Ok(record) = serde_json::from_str::<JobRecord>(&raw) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(Ordering::Equal)
        });
        records
    }

    pub fn latest(&self) -> Option<JobRecord> {
        self.list().into_iter().next()
    }

    pub fn find(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
        let path = self.record_path(job_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing {}", path.display()))?;
        Ok(Some(record))
    }

    /// In-place status flip on successful materialization. The record file is
    /// rewritten without an atomic rename; a crash mid-write can corrupt it.
    pub fn mark_completed(&self, record: &mut JobRecord, image_count: u64) -> anyhow::Result<()> {
        record.status = JobStatus::Completed;
        record.image_count = Some(image_count);
        self.write(record)
    }

    fn write(&self, record: &JobRecord) -> anyhow::Result<()> {
        let path = self.record_path(&record.job_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(record)?)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
