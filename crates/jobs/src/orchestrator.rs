//! Job orchestrator
//!
//! `dispatch` resolves idempotency and hands the job to the worker body;
//! the worker body claims the lease, determines the part layout, drives
//! each remaining part through the pipeline, and checkpoints after every
//! part so the next attempt starts where this one stopped. The lease is
//! released on every exit path.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use media_ingest_chunking::{should_chunk, ChunkingConfig, ChunkingEngine, Transcoder};
use media_ingest_common::{ProcessingError, ProcessingOptions};
use media_ingest_pipeline::{run_pipeline, PipelineEnv, ProcessingContext};
use media_ingest_storage::{JobRecord, JobStatus, JobStore, StorageError};

use crate::lease::LeaseManager;
use crate::{manifest_key, part_key, source_key, JobError, JobResult};

/// Engine-wide configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease timeout handed to the store on every acquire
    pub lease_timeout_ms: u64,

    /// Retry budget written onto new job records
    pub max_retries: u32,

    /// Part sizing
    pub chunking: ChunkingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: std::env::var("LEASE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::DEFAULT_LEASE_TIMEOUT_MS),
            max_retries: std::env::var("JOB_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            chunking: ChunkingConfig::default(),
        }
    }
}

/// Durable description of the part layout, written next to the parts so a
/// resumed job reconstructs the same layout without re-chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsManifest {
    pub parts: Vec<PartEntry>,
}

/// One processable part. The time span locates it within the full asset;
/// an unsplit asset has the sentinel span `(0.0, 0.0)` since its duration
/// is never probed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartEntry {
    pub part_index: u32,
    pub storage_key: String,
    pub byte_size: u64,
    pub start_time_sec: f64,
    pub end_time_sec: f64,
}

/// Job orchestrator over a job store, the pipeline collaborators, and a
/// chunking engine
pub struct JobOrchestrator<T: Transcoder> {
    store: Arc<dyn JobStore>,
    env: PipelineEnv,
    chunking: ChunkingEngine<T>,
    lease: LeaseManager,
    config: EngineConfig,
}

impl<T: Transcoder + 'static> JobOrchestrator<T> {
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        env: PipelineEnv,
        chunking: ChunkingEngine<T>,
        config: EngineConfig,
    ) -> Self {
        let lease = LeaseManager::new(store.clone(), config.lease_timeout_ms);
        Self {
            store,
            env,
            chunking,
            lease,
            config,
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        self.lease.holder()
    }

    /// Dispatch processing for `(subject_id, owner_id)`.
    ///
    /// Returns the job record immediately; the worker body runs in a
    /// spawned task. Re-dispatching the same pair resolves to the same
    /// job: a completed job is returned unchanged, a job another worker
    /// is actively processing is returned as-is, and an interrupted or
    /// failed job is resumed from its checkpoint.
    pub async fn dispatch(
        self: &Arc<Self>,
        subject_id: &str,
        owner_id: &str,
        options: ProcessingOptions,
    ) -> JobResult<JobRecord> {
        if let Some(existing) = self.resolve_existing(subject_id, owner_id).await? {
            return Ok(self.dispatch_existing(existing));
        }

        let job = JobRecord::new(subject_id, owner_id, options, self.config.max_retries);
        info!(
            job_id = %job.id,
            subject_id,
            owner_id,
            "Created job"
        );

        match self.store.insert(&job).await {
            Ok(()) => {
                self.spawn_worker(job.id.clone());
                Ok(job)
            }
            // Concurrent dispatch lost the insert race; resolve to the winner
            Err(StorageError::Conflict(_)) => {
                let existing = self
                    .resolve_existing(subject_id, owner_id)
                    .await?
                    .ok_or_else(|| JobError::NotFound(job.id.clone()))?;
                Ok(self.dispatch_existing(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_existing(
        &self,
        subject_id: &str,
        owner_id: &str,
    ) -> JobResult<Option<JobRecord>> {
        let key = JobRecord::idempotency_key(owner_id, subject_id);
        if let Some(job) = self.store.find_by_idempotency_key(owner_id, &key).await? {
            return Ok(Some(job));
        }
        // Records created before idempotency keys existed
        Ok(self.store.find_by_subject(owner_id, subject_id).await?)
    }

    fn dispatch_existing(self: &Arc<Self>, job: JobRecord) -> JobRecord {
        if job.status == JobStatus::Completed {
            debug!(job_id = %job.id, "Dispatch resolved to completed job");
            return job;
        }
        if job.is_leased(Utc::now()) {
            info!(job_id = %job.id, "Job is live on another worker; reusing");
            return job;
        }
        self.spawn_worker(job.id.clone());
        job
    }

    fn spawn_worker(self: &Arc<Self>, job_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run(&job_id).await {
                Ok(_) => {}
                // Lost the lease race between the check and the acquire
                Err(JobError::AlreadyProcessing(_)) => {
                    debug!(job_id = %job_id, "Job was claimed by another worker");
                }
                Err(e) => {
                    warn!(job_id = %job_id, "Worker body aborted: {e}");
                }
            }
        });
    }

    /// Worker body: claim the job, process its remaining parts, persist
    /// the terminal status, release the lease.
    ///
    /// A processing failure is recorded on the returned record (status
    /// `Failed`, message in `error`), never re-thrown past the lease
    /// release. The errors this returns are pre-claim: lease contention,
    /// a missing record, a store failure before work started.
    pub async fn run(&self, job_id: &str) -> JobResult<JobRecord> {
        if !self.lease.acquire(job_id).await? {
            return Err(JobError::AlreadyProcessing(job_id.to_string()));
        }

        let mut job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.lease.release(job_id).await?;
                return Err(JobError::NotFound(job_id.to_string()));
            }
            Err(e) => {
                self.lease.release(job_id).await?;
                return Err(e.into());
            }
        };

        if job.status == JobStatus::Completed {
            self.lease.release(job_id).await?;
            return Ok(job);
        }

        let outcome = self.execute(&mut job).await;

        match outcome {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.advance_progress(100);
                job.completed_at = Some(Utc::now());
                if let Err(e) = self.store.update(&job).await {
                    error!(job_id = %job.id, "Failed to persist completion: {e}");
                } else {
                    info!(job_id = %job.id, parts = job.part_count, "Job completed");
                }
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                if let Err(pe) = self.store.update(&job).await {
                    error!(job_id = %job.id, "Failed to persist failure: {pe}");
                }
                warn!(
                    job_id = %job.id,
                    progress = job.progress,
                    "Job failed: {e}"
                );
            }
        }

        // Release happens whatever the outcome was
        if let Err(e) = self.lease.release(job_id).await {
            warn!(job_id = %job.id, "Failed to release lease: {e}");
        }

        Ok(job)
    }

    /// Process every part the job has not durably finished yet
    async fn execute(&self, job: &mut JobRecord) -> media_ingest_common::Result<()> {
        // Entering processing clears any previous failure; progress and
        // processed parts are never reset.
        job.status = JobStatus::Processing;
        job.error = None;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        self.store.update(job).await?;

        let parts = self.resolve_parts(job).await?;
        let part_count = parts.len() as u32;
        if job.part_count != part_count {
            job.part_count = part_count;
            self.store.update(job).await?;
        }

        // The cursor is a fast path; the processed set stays authoritative
        let start = u32::try_from(job.resume_cursor + 1).unwrap_or(0);
        for part in parts.iter().filter(|p| p.part_index >= start) {
            if job.processed_parts.contains(&part.part_index) {
                debug!(job_id = %job.id, part_index = part.part_index, "Part already processed, skipping");
                continue;
            }

            self.process_part(job, part).await?;

            job.mark_part_processed(part.part_index);
            let done = job.processed_parts.len() as u64;
            // 90% spread across parts; the final 10% lands on completion
            job.advance_progress(((done * 90) / u64::from(part_count)) as u8);
            self.store.update(job).await?;

            // The timeout is sized for one part, not a whole job; restart
            // the clock at each checkpoint so long jobs stay claimed.
            if !self
                .store
                .renew_lease(&job.id, self.lease.holder(), self.config.lease_timeout_ms)
                .await?
            {
                return Err(ProcessingError::Other(format!(
                    "Lease on job {} was lost during processing",
                    job.id
                )));
            }

            info!(
                job_id = %job.id,
                part_index = part.part_index,
                progress = job.progress,
                "Checkpointed part"
            );
        }

        Ok(())
    }

    /// Determine the part layout: reuse the persisted manifest on resume,
    /// otherwise chunk the source if it crosses the proactive threshold.
    async fn resolve_parts(&self, job: &JobRecord) -> media_ingest_common::Result<Vec<PartEntry>> {
        let objects = &self.env.object_storage;
        let src = source_key(&job.owner_id, &job.subject_id);
        if !objects.exists(&src).await? {
            return Err(ProcessingError::StorageError(format!(
                "Source object missing: {src}"
            )));
        }

        let mkey = manifest_key(&job.owner_id, &job.subject_id);
        if job.part_count > 0 && objects.exists(&mkey).await? {
            let data = objects.read(&mkey).await?;
            let manifest: PartsManifest = serde_json::from_slice(&data)
                .map_err(|e| ProcessingError::Other(format!("Bad parts manifest: {e}")))?;
            debug!(job_id = %job.id, parts = manifest.parts.len(), "Reusing parts manifest");
            return Ok(manifest.parts);
        }

        let size = objects.size(&src).await?;
        if !should_chunk(size, self.config.chunking.proactive_threshold_bytes) {
            // An unsplit asset carries the (0.0, 0.0) span sentinel: the
            // whole source is one part and its duration was never probed.
            return Ok(vec![PartEntry {
                part_index: 0,
                storage_key: src,
                byte_size: size,
                start_time_sec: 0.0,
                end_time_sec: 0.0,
            }]);
        }

        info!(job_id = %job.id, size, "Source exceeds chunk threshold; splitting");

        let scratch = tempfile::tempdir()?;
        let local = scratch.path().join("source");
        let bytes = objects.read(&src).await?;
        tokio::fs::write(&local, &bytes).await?;

        let media_parts = self.chunking.chunk_media(&local, scratch.path()).await?;

        let mut entries = Vec::with_capacity(media_parts.len());
        for part in &media_parts {
            let key = part_key(&job.owner_id, &job.subject_id, part.part_index);
            let data = tokio::fs::read(&part.path).await?;
            objects.write(&key, &data, None).await?;
            entries.push(PartEntry {
                part_index: part.part_index,
                storage_key: key,
                byte_size: part.byte_size,
                start_time_sec: part.start_time_sec,
                end_time_sec: part.end_time_sec,
            });
        }

        let manifest = PartsManifest {
            parts: entries.clone(),
        };
        let payload = serde_json::to_vec(&manifest)
            .map_err(|e| ProcessingError::Other(format!("Manifest encode failed: {e}")))?;
        objects
            .write(&mkey, &payload, Some("application/json"))
            .await?;

        Ok(entries)
    }

    async fn process_part(
        &self,
        job: &JobRecord,
        part: &PartEntry,
    ) -> media_ingest_common::Result<()> {
        let size = self.env.object_storage.size(&part.storage_key).await?;
        if size > self.config.chunking.target_part_bytes {
            return self.process_oversized_part(job, part, size).await;
        }

        let ctx = ProcessingContext::new(
            &job.id,
            &job.subject_id,
            &job.owner_id,
            &part.storage_key,
            job.options.source_kind,
            part.part_index,
            (part.start_time_sec, part.end_time_sec),
            job.options.clone(),
        );
        run_pipeline(&self.env, ctx).await?;
        Ok(())
    }

    /// A part that grew past the hard ceiling (stale manifest, probe
    /// error) is split again and its sub-parts run sequentially under the
    /// original part index.
    async fn process_oversized_part(
        &self,
        job: &JobRecord,
        part: &PartEntry,
        size: u64,
    ) -> media_ingest_common::Result<()> {
        warn!(
            job_id = %job.id,
            part_index = part.part_index,
            size,
            ceiling = self.config.chunking.target_part_bytes,
            "Part exceeds hard ceiling; re-chunking into sub-parts"
        );

        let scratch = tempfile::tempdir()?;
        let local = scratch.path().join("part");
        let bytes = self.env.object_storage.read(&part.storage_key).await?;
        tokio::fs::write(&local, &bytes).await?;

        let sub_parts = self.chunking.chunk_media(&local, scratch.path()).await?;

        for sub in &sub_parts {
            let sub_key = format!("{}/sub_{:02}", part.storage_key, sub.part_index);
            let data = tokio::fs::read(&sub.path).await?;
            self.env.object_storage.write(&sub_key, &data, None).await?;

            let ctx = ProcessingContext::new(
                &job.id,
                &job.subject_id,
                &job.owner_id,
                &sub_key,
                job.options.source_kind,
                part.part_index,
                (
                    part.start_time_sec + sub.start_time_sec,
                    part.start_time_sec + sub.end_time_sec,
                ),
                job.options.clone(),
            );
            run_pipeline(&self.env, ctx).await?;
        }

        Ok(())
    }
}
