//! Job engine: state machine, lease coordination, orchestration, recovery
//!
//! A job is one durable processing request for a media asset. Workers
//! coordinate through the job store's atomic lease write, process parts
//! strictly in order with a checkpoint after each one, and leave enough
//! state behind that any worker can resume an interrupted job from its
//! last checkpoint. The recovery loop sweeps up jobs whose worker died
//! and uploads that never got a job at all.

use media_ingest_common::ProcessingError;
use media_ingest_storage::StorageError;
use thiserror::Error;

pub mod lease;
pub mod orchestrator;
pub mod recovery;

pub use lease::{LeaseManager, DEFAULT_LEASE_TIMEOUT_MS};
pub use orchestrator::{EngineConfig, JobOrchestrator, PartEntry, PartsManifest};
pub use recovery::{RecoveryConfig, RecoveryLoop};

/// Job engine errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Another worker holds an unexpired lease on the job
    #[error("Job {0} is held by another worker")]
    AlreadyProcessing(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for job engine operations
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Object storage key of the raw uploaded asset
#[must_use]
pub fn source_key(owner_id: &str, subject_id: &str) -> String {
    format!("{owner_id}/{subject_id}/source")
}

/// Object storage key of one extracted part
#[must_use]
pub fn part_key(owner_id: &str, subject_id: &str, part_index: u32) -> String {
    format!("{owner_id}/{subject_id}/parts/part_{part_index:04}")
}

/// Object storage key of the parts manifest
#[must_use]
pub fn manifest_key(owner_id: &str, subject_id: &str) -> String {
    format!("{owner_id}/{subject_id}/parts/manifest.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(source_key("o1", "s1"), "o1/s1/source");
        assert_eq!(part_key("o1", "s1", 3), "o1/s1/parts/part_0003");
        assert_eq!(manifest_key("o1", "s1"), "o1/s1/parts/manifest.json");
    }
}
