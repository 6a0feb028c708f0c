//! End-to-end engine scenarios over in-memory backends and fake providers

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use media_ingest_chunking::{ChunkingConfig, ChunkingEngine, MediaProbe, Transcoder};
use media_ingest_common::{
    EmbeddedRecord, EmbeddingInput, EmbeddingProvider, Metadata, ProcessingError,
    ProcessingOptions, Result as ProcResult, SourceKind, TranscribeOptions, Transcript,
    TranscriptSegment, TranscriptionProvider,
};
use media_ingest_jobs::{
    source_key, EngineConfig, JobError, JobOrchestrator, RecoveryConfig, RecoveryLoop,
};
use media_ingest_pipeline::PipelineEnv;
use media_ingest_storage::{
    JobRecord, JobStatus, JobStore, MemoryJobStore, MemoryObjectStorage, MemoryTranscriptStore,
    MemoryUploadIndex, MemoryVectorStore, ObjectStorage, UploadIndex, UploadRecord,
};

const OWNER: &str = "owner-1";
const SUBJECT: &str = "subject-1";

/// Writes `duration * 1000` zero bytes per extracted segment; a 30s source
/// therefore splits into three 10 KB parts under a 10 KB ceiling.
struct FakeTranscoder {
    duration_sec: f64,
}

#[async_trait::async_trait]
impl Transcoder for FakeTranscoder {
    async fn probe(&self, _input: &Path) -> ProcResult<MediaProbe> {
        Ok(MediaProbe {
            duration_sec: self.duration_sec,
            bit_rate: Some(8_000),
            format: "fake".to_string(),
        })
    }

    async fn extract_segment(
        &self,
        _input: &Path,
        output: &Path,
        _start_sec: f64,
        duration_sec: f64,
    ) -> ProcResult<()> {
        let size = (duration_sec * 1_000.0) as usize;
        tokio::fs::write(output, vec![0u8; size]).await?;
        Ok(())
    }
}

/// Records every transcription call and fails exactly once for each
/// configured key marker.
struct FlakyTranscription {
    calls: Mutex<Vec<String>>,
    fail_once: Mutex<HashSet<String>>,
}

impl FlakyTranscription {
    fn new(fail_once_markers: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_once: Mutex::new(fail_once_markers.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn calls_for(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(marker))
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl TranscriptionProvider for FlakyTranscription {
    async fn transcribe(
        &self,
        _media: &[u8],
        source_id: &str,
        _kind: SourceKind,
        _options: &TranscribeOptions,
    ) -> ProcResult<Transcript> {
        self.calls.lock().unwrap().push(source_id.to_string());

        let marker = {
            let fail_once = self.fail_once.lock().unwrap();
            fail_once.iter().find(|m| source_id.contains(*m)).cloned()
        };
        if let Some(marker) = marker {
            self.fail_once.lock().unwrap().remove(&marker);
            return Err(ProcessingError::TranscriptionError(format!(
                "injected failure for {source_id}"
            )));
        }

        Ok(Transcript {
            segments: vec![TranscriptSegment {
                id: format!("{source_id}:s0"),
                speaker_id: None,
                text: "spoken words".to_string(),
                start_time_sec: 0.0,
                end_time_sec: 5.0,
            }],
            language: Some("en".to_string()),
            speakers: vec![],
        })
    }
}

struct FakeEmbedding;

#[async_trait::async_trait]
impl EmbeddingProvider for FakeEmbedding {
    async fn embed(&self, inputs: &[EmbeddingInput]) -> ProcResult<Vec<EmbeddedRecord>> {
        Ok(inputs
            .iter()
            .map(|i| EmbeddedRecord {
                id: i.id.clone(),
                embedding: vec![0.25; 8],
                metadata: Metadata::new(),
            })
            .collect())
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    objects: Arc<MemoryObjectStorage>,
    vectors: Arc<MemoryVectorStore>,
    uploads: Arc<MemoryUploadIndex>,
    transcription: Arc<FlakyTranscription>,
    orchestrator: Arc<JobOrchestrator<FakeTranscoder>>,
}

fn harness(fail_once_markers: &[&str]) -> Harness {
    harness_with(fail_once_markers, 10_000, 5_000)
}

fn harness_with(
    fail_once_markers: &[&str],
    target_part_bytes: u64,
    proactive_threshold_bytes: u64,
) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let objects = Arc::new(MemoryObjectStorage::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let uploads = Arc::new(MemoryUploadIndex::new());
    let transcription = Arc::new(FlakyTranscription::new(fail_once_markers));

    let env = PipelineEnv {
        transcription: transcription.clone(),
        embedding: Arc::new(FakeEmbedding),
        vector_store: vectors.clone(),
        transcript_store: Arc::new(MemoryTranscriptStore::new()),
        object_storage: objects.clone(),
    };

    let config = EngineConfig {
        lease_timeout_ms: 60_000,
        max_retries: 3,
        chunking: ChunkingConfig {
            target_part_bytes,
            proactive_threshold_bytes,
            fixed_window_sec: None,
        },
    };
    let chunking = ChunkingEngine::new(
        FakeTranscoder { duration_sec: 30.0 },
        config.chunking.clone(),
    );

    let orchestrator = Arc::new(JobOrchestrator::new(
        store.clone() as Arc<dyn JobStore>,
        env,
        chunking,
        config,
    ));

    Harness {
        store,
        objects,
        vectors,
        uploads,
        transcription,
        orchestrator,
    }
}

impl Harness {
    async fn seed_source(&self, bytes: usize) {
        self.objects
            .write(&source_key(OWNER, SUBJECT), &vec![0u8; bytes], None)
            .await
            .unwrap();
    }

    /// Poll until the spawned worker body drives the job to `status` and
    /// releases its lease (the status lands just before the release)
    async fn wait_for(&self, job_id: &str, status: JobStatus) -> JobRecord {
        for _ in 0..1_000 {
            if let Some(job) = self.store.get(job_id).await.unwrap() {
                if job.status == status && job.lease.is_none() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status:?}");
    }

    fn recovery(&self) -> RecoveryLoop<FakeTranscoder> {
        RecoveryLoop::new(
            self.orchestrator.clone(),
            self.store.clone() as Arc<dyn JobStore>,
            self.uploads.clone() as Arc<dyn UploadIndex>,
            self.objects.clone() as Arc<dyn ObjectStorage>,
            RecoveryConfig {
                interval_secs: 1,
                scan_limit: 10,
                upload_scan_limit: 10,
            },
        )
    }
}

#[tokio::test]
async fn test_small_source_processes_as_single_part() {
    let h = harness(&[]);
    h.seed_source(1_000).await;

    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let done = h.wait_for(&job.id, JobStatus::Completed).await;

    assert_eq!(done.progress, 100);
    assert_eq!(done.part_count, 1);
    assert_eq!(h.transcription.total_calls(), 1);
    assert_eq!(h.vectors.len().await, 1);
}

#[tokio::test]
async fn test_dispatch_is_idempotent() {
    let h = harness(&[]);
    h.seed_source(1_000).await;

    let first = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    h.wait_for(&first.id, JobStatus::Completed).await;

    let second = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();

    // Same job, and the completed record short-circuits without rework
    assert_eq!(first.id, second.id);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(h.transcription.total_calls(), 1);
    assert_eq!(h.vectors.len().await, 1);
}

#[tokio::test]
async fn test_large_source_is_chunked_and_each_part_embedded() {
    let h = harness(&[]);
    h.seed_source(30_000).await;

    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let done = h.wait_for(&job.id, JobStatus::Completed).await;

    assert_eq!(done.part_count, 3);
    assert_eq!(done.processed_parts.len(), 3);
    assert_eq!(h.transcription.total_calls(), 3);
    assert_eq!(h.vectors.len().await, 3);
}

#[tokio::test]
async fn test_oversized_part_rechunked_into_subparts() {
    // Hard ceiling below the proactive threshold: the source stays a
    // single part, then trips the ceiling at processing time
    let h = harness_with(&[], 10_000, 50_000);
    h.seed_source(30_000).await;

    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let done = h.wait_for(&job.id, JobStatus::Completed).await;

    assert_eq!(done.part_count, 1);
    assert_eq!(done.processed_parts.len(), 1);

    // Every sub-part's media went through transcription, none aliased
    assert_eq!(h.transcription.calls_for("sub_00"), 1);
    assert_eq!(h.transcription.calls_for("sub_01"), 1);
    assert_eq!(h.transcription.calls_for("sub_02"), 1);
    assert_eq!(h.transcription.total_calls(), 3);
    assert_eq!(h.vectors.len().await, 3);
}

#[tokio::test]
async fn test_failure_then_resume_processes_only_remaining_parts() {
    let h = harness(&["part_0001"]);
    h.seed_source(30_000).await;

    // First attempt dies on the second part
    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let failed = h.wait_for(&job.id, JobStatus::Failed).await;

    assert!(failed
        .error
        .as_deref()
        .is_some_and(|e| e.contains("injected failure")));
    assert_eq!(failed.progress, 30);
    assert_eq!(failed.processed_parts.iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(failed.resume_cursor, 0);
    assert!(failed.lease.is_none());

    // Resume: part 0 is never touched again, parts 1 and 2 complete
    let resumed = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.id, failed.id);

    let done = h.wait_for(&failed.id, JobStatus::Completed).await;
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());
    assert_eq!(done.processed_parts.len(), 3);
    assert_eq!(h.transcription.calls_for("part_0000"), 1);
    assert_eq!(h.transcription.calls_for("part_0001"), 2);
    assert_eq!(h.transcription.calls_for("part_0002"), 1);
    assert_eq!(h.vectors.len().await, 3);
}

#[tokio::test]
async fn test_progress_never_decreases_across_failure() {
    let h = harness(&["part_0001"]);
    h.seed_source(30_000).await;

    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let after_failure = h.wait_for(&job.id, JobStatus::Failed).await;

    h.orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    let done = h.wait_for(&job.id, JobStatus::Completed).await;

    assert!(done.progress >= after_failure.progress);
    assert_eq!(done.progress, 100);
}

#[tokio::test]
async fn test_run_refuses_leased_job() {
    let h = harness(&[]);
    h.seed_source(1_000).await;

    let job = JobRecord::new(SUBJECT, OWNER, ProcessingOptions::default(), 3);
    h.store.insert(&job).await.unwrap();
    assert!(h
        .store
        .try_acquire_lease(&job.id, "other-worker", 60_000)
        .await
        .unwrap());

    let err = h.orchestrator.run(&job.id).await.unwrap_err();
    assert!(matches!(err, JobError::AlreadyProcessing(_)));

    // The record was not touched by the refused worker
    let untouched = h.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::Pending);
    assert_eq!(h.transcription.total_calls(), 0);
}

#[tokio::test]
async fn test_dispatch_reuses_live_job_without_work() {
    let h = harness(&[]);
    h.seed_source(1_000).await;

    let job = JobRecord::new(SUBJECT, OWNER, ProcessingOptions::default(), 3);
    h.store.insert(&job).await.unwrap();
    h.store
        .try_acquire_lease(&job.id, "other-worker", 60_000)
        .await
        .unwrap();

    let returned = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();

    assert_eq!(returned.id, job.id);
    assert_eq!(h.transcription.total_calls(), 0);
}

#[tokio::test]
async fn test_stale_lease_is_taken_over() {
    let h = harness(&[]);
    h.seed_source(1_000).await;

    let job = JobRecord::new(SUBJECT, OWNER, ProcessingOptions::default(), 3);
    h.store.insert(&job).await.unwrap();
    // Zero timeout: the holder is dead the moment it acquires
    h.store
        .try_acquire_lease(&job.id, "dead-worker", 0)
        .await
        .unwrap();

    let finished = h.orchestrator.run(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_recovery_retries_failed_job() {
    // Single-part job: the storage key is the source object itself
    let h = harness(&["source"]);
    h.seed_source(1_000).await;

    let job = h
        .orchestrator
        .dispatch(SUBJECT, OWNER, ProcessingOptions::default())
        .await
        .unwrap();
    h.wait_for(&job.id, JobStatus::Failed).await;

    let retried = h.recovery().scan_once().await.unwrap();
    assert_eq!(retried, 1);

    let recovered = h.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Completed);
    assert_eq!(recovered.retry_count, 1);
    assert!(recovered.last_retry_at.is_some());
}

#[tokio::test]
async fn test_recovery_skips_exhausted_jobs() {
    let h = harness(&["source"]);
    h.seed_source(1_000).await;

    let mut job = JobRecord::new(SUBJECT, OWNER, ProcessingOptions::default(), 2);
    job.status = JobStatus::Failed;
    job.retry_count = 2;
    h.store.insert(&job).await.unwrap();

    let retried = h.recovery().scan_once().await.unwrap();
    assert_eq!(retried, 0);

    let untouched = h.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::Failed);
    assert_eq!(untouched.retry_count, 2);
    assert_eq!(h.transcription.total_calls(), 0);
}

#[tokio::test]
async fn test_upload_gap_scan_dispatches_missing_job() {
    let h = harness(&[]);
    h.seed_source(1_000).await;
    h.uploads
        .push(UploadRecord {
            owner_id: OWNER.to_string(),
            subject_id: SUBJECT.to_string(),
            storage_key: source_key(OWNER, SUBJECT),
            completed_at: Utc::now(),
        })
        .await;

    let dispatched = h.recovery().scan_upload_gaps().await.unwrap();
    assert_eq!(dispatched, 1);

    let job = h
        .store
        .find_by_subject(OWNER, SUBJECT)
        .await
        .unwrap()
        .unwrap();
    h.wait_for(&job.id, JobStatus::Completed).await;

    // Once the job exists the gap scan leaves the subject alone
    let again = h.recovery().scan_upload_gaps().await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_upload_gap_scan_ignores_missing_bytes() {
    let h = harness(&[]);
    // Upload record without the object behind it
    h.uploads
        .push(UploadRecord {
            owner_id: OWNER.to_string(),
            subject_id: SUBJECT.to_string(),
            storage_key: source_key(OWNER, SUBJECT),
            completed_at: Utc::now(),
        })
        .await;

    let dispatched = h.recovery().scan_upload_gaps().await.unwrap();
    assert_eq!(dispatched, 0);
    assert!(h.store.find_by_subject(OWNER, SUBJECT).await.unwrap().is_none());
}
