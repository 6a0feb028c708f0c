//! Job records and the job store interface
//!
//! A `JobRecord` is the persistent record of one logical "process this
//! asset" request. It is mutated exclusively by whichever worker holds its
//! lease; every other process may read it but must go through
//! [`JobStore::try_acquire_lease`] before touching `status`,
//! `processed_parts`, `resume_cursor` or the lease itself.

use crate::StorageResult;
use chrono::{DateTime, Duration, Utc};
use media_ingest_common::ProcessingOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Job lifecycle states.
///
/// `Pending -> Processing -> {Completed | Failed}`; `Failed -> Processing`
/// is the resume transition. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::StorageError::SerializationError(format!(
                "Unknown job status: {other}"
            ))),
        }
    }
}

/// A time-bounded claim of exclusive processing rights over a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker identity holding the lease
    pub holder: String,
    /// When the lease was written
    pub acquired_at: DateTime<Utc>,
    /// Staleness window in milliseconds
    pub timeout_ms: u64,
}

impl Lease {
    /// Whether the lease has outlived its timeout at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.acquired_at >= Duration::milliseconds(self.timeout_ms as i64)
    }
}

/// Persistent record of one logical processing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque identifier, generated on creation, immutable
    pub id: String,
    /// The media asset being processed
    pub subject_id: String,
    /// Tenant/user owning the asset
    pub owner_id: String,
    /// Deterministic key derived from `(subject_id, owner_id)`
    pub idempotency_key: String,
    pub status: JobStatus,
    /// 0-100, monotonically non-decreasing while processing, never reset
    pub progress: u8,
    /// Number of parts the asset was split into (1 for an unsplit asset);
    /// 0 until the first worker determined it
    pub part_count: u32,
    /// Part indices fully driven through the pipeline and durably
    /// persisted downstream; append-only
    pub processed_parts: BTreeSet<u32>,
    /// Index of the last part processed (-1 = none). A fast-path cursor;
    /// `processed_parts` stays authoritative for correctness.
    pub resume_cursor: i64,
    /// Present while a worker owns the job
    pub lease: Option<Lease>,
    /// Incremented only when the recovery loop re-dispatches, never on the
    /// first attempt
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Frozen configuration snapshot captured at creation
    pub options: ProcessingOptions,
    /// Last failure reason, cleared on successful resume
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh pending record for `(subject_id, owner_id)`
    #[must_use]
    pub fn new(
        subject_id: &str,
        owner_id: &str,
        options: ProcessingOptions,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job-{}", uuid::Uuid::new_v4()),
            subject_id: subject_id.to_string(),
            owner_id: owner_id.to_string(),
            idempotency_key: Self::idempotency_key(owner_id, subject_id),
            status: JobStatus::Pending,
            progress: 0,
            part_count: 0,
            processed_parts: BTreeSet::new(),
            resume_cursor: -1,
            lease: None,
            retry_count: 0,
            max_retries,
            last_retry_at: None,
            options,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Deterministic deduplication key for `(owner_id, subject_id)`.
    /// Re-submitting the same request always lands on the same key.
    #[must_use]
    pub fn idempotency_key(owner_id: &str, subject_id: &str) -> String {
        let digest = Sha256::digest(format!("{owner_id}:{subject_id}").as_bytes());
        format!("{digest:x}")
    }

    /// Raise progress to `value`, ignoring any lower value. Progress is a
    /// liveness signal for external observers and never moves backwards,
    /// including across failure/resume cycles.
    pub fn advance_progress(&mut self, value: u8) {
        if value > self.progress {
            self.progress = value.min(100);
        }
    }

    /// Record that `index` passed fully through the pipeline and advance
    /// the resume cursor
    pub fn mark_part_processed(&mut self, index: u32) {
        self.processed_parts.insert(index);
        if i64::from(index) > self.resume_cursor {
            self.resume_cursor = i64::from(index);
        }
    }

    /// Whether the job still needs work
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        !matches!(self.status, JobStatus::Completed)
    }

    /// Whether an active (unexpired) lease exists at `now`
    #[must_use]
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Whether the retry budget is exhausted
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Persistence interface for job records.
///
/// `try_acquire_lease`, `renew_lease` and `release_lease` are the only
/// lease mutations; implementations must make the acquire a single atomic
/// conditional write (absent-or-expired check and lease write in one
/// step).
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created record
    async fn insert(&self, job: &JobRecord) -> StorageResult<()>;

    /// Load a record by id
    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>>;

    /// Idempotency lookup by `(owner_id, idempotency_key)`
    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> StorageResult<Option<JobRecord>>;

    /// Fallback scan by `(owner_id, subject_id)` for records created
    /// before idempotency keys existed
    async fn find_by_subject(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> StorageResult<Option<JobRecord>>;

    /// Persist the current state of a record (lease fields excluded; those
    /// only move through the lease operations)
    async fn update(&self, job: &JobRecord) -> StorageResult<()>;

    /// Atomically write a lease if none exists or the existing one has
    /// expired. Returns false when an unexpired lease is held elsewhere.
    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        timeout_ms: u64,
    ) -> StorageResult<bool>;

    /// Refresh the acquisition time of a lease the caller already holds,
    /// so a long job does not outlive its own timeout. Returns false when
    /// the caller is no longer the holder.
    async fn renew_lease(&self, id: &str, holder: &str, timeout_ms: u64) -> StorageResult<bool>;

    /// Unconditionally clear the lease. Safe to call when no lease is held.
    async fn release_lease(&self, id: &str) -> StorageResult<()>;

    /// Incomplete jobs with no active lease, oldest-updated first, bounded
    /// by `limit`
    async fn find_recoverable(&self, limit: usize) -> StorageResult<Vec<JobRecord>>;
}

/// A completed upload: bytes landed in object storage for a subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub owner_id: String,
    pub subject_id: String,
    pub storage_key: String,
    pub completed_at: DateTime<Utc>,
}

/// Index of completed uploads, scanned by the recovery loop to find
/// assets whose processing dispatch was lost
#[async_trait::async_trait]
pub trait UploadIndex: Send + Sync {
    async fn list_completed(&self, limit: usize) -> StorageResult<Vec<UploadRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = JobRecord::idempotency_key("owner-1", "subject-1");
        let b = JobRecord::idempotency_key("owner-1", "subject-1");
        let c = JobRecord::idempotency_key("owner-2", "subject-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut job = JobRecord::new("s", "o", ProcessingOptions::default(), 3);
        job.advance_progress(40);
        job.advance_progress(20);
        assert_eq!(job.progress, 40);
        job.advance_progress(200);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_mark_part_processed_advances_cursor() {
        let mut job = JobRecord::new("s", "o", ProcessingOptions::default(), 3);
        assert_eq!(job.resume_cursor, -1);

        job.mark_part_processed(0);
        job.mark_part_processed(2);
        assert_eq!(job.resume_cursor, 2);
        // Out-of-order insertion never moves the cursor backwards
        job.mark_part_processed(1);
        assert_eq!(job.resume_cursor, 2);
        assert_eq!(job.processed_parts.len(), 3);
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease {
            holder: "w1".to_string(),
            acquired_at: Utc::now() - Duration::minutes(31),
            timeout_ms: 30 * 60 * 1000,
        };
        assert!(lease.is_expired(Utc::now()));

        let fresh = Lease {
            holder: "w1".to_string(),
            acquired_at: Utc::now(),
            timeout_ms: 30 * 60 * 1000,
        };
        assert!(!fresh.is_expired(Utc::now()));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("bogus").is_err());
    }
}
