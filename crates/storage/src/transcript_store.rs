//! Transcript persistence interface
//!
//! Transcripts are keyed by `(job_id, source_key)`, where the source key
//! is the object storage key of the media the transcript came from. Parts
//! and re-chunked sub-parts have distinct storage keys, so each one keeps
//! its own transcript. Writes are upserts, so a part replayed after a
//! crash overwrites its own transcript instead of duplicating it.

use crate::StorageResult;
use media_ingest_common::Transcript;

#[async_trait::async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Save (upsert) the transcript for one media object of a job
    async fn save(&self, job_id: &str, source_key: &str, transcript: &Transcript)
        -> StorageResult<()>;

    /// Load the transcript for one media object of a job, if present
    async fn load(&self, job_id: &str, source_key: &str) -> StorageResult<Option<Transcript>>;
}
