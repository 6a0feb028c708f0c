//! Recovery loop
//!
//! Two periodic sweeps keep the system converging:
//! - incomplete jobs with no active lease are re-dispatched, oldest-updated
//!   first, until their retry budget runs out;
//! - completed uploads that never got a job record at all (the dispatch
//!   was lost between upload and job creation) get a fresh dispatch.
//!
//! A broken candidate never stops the sweep; each one fails on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use media_ingest_chunking::Transcoder;
use media_ingest_common::ProcessingOptions;
use media_ingest_storage::{JobStatus, JobStore, ObjectStorage, UploadIndex};

use crate::{JobError, JobOrchestrator, JobResult};

/// Recovery loop configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Page bound for the recoverable-jobs scan
    pub scan_limit: usize,

    /// Page bound for the upload-gap scan
    pub upload_scan_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: std::env::var("RECOVERY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            scan_limit: std::env::var("RECOVERY_SCAN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            upload_scan_limit: std::env::var("RECOVERY_UPLOAD_SCAN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
        }
    }
}

/// Periodic recovery sweeps over the job store and the upload index
pub struct RecoveryLoop<T: Transcoder> {
    orchestrator: Arc<JobOrchestrator<T>>,
    store: Arc<dyn JobStore>,
    uploads: Arc<dyn UploadIndex>,
    objects: Arc<dyn ObjectStorage>,
    config: RecoveryConfig,
}

impl<T: Transcoder + 'static> RecoveryLoop<T> {
    #[must_use]
    pub fn new(
        orchestrator: Arc<JobOrchestrator<T>>,
        store: Arc<dyn JobStore>,
        uploads: Arc<dyn UploadIndex>,
        objects: Arc<dyn ObjectStorage>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            uploads,
            objects,
            config,
        }
    }

    /// Run the sweeps forever at the configured interval
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        info!(
            interval_secs = self.config.interval_secs,
            "Recovery loop started"
        );
        loop {
            interval.tick().await;
            match self.scan_once().await {
                Ok(retried) if retried > 0 => info!(retried, "Recovery sweep re-dispatched jobs"),
                Ok(_) => debug!("Recovery sweep found nothing to do"),
                Err(e) => error!("Recovery sweep failed: {e}"),
            }
            match self.scan_upload_gaps().await {
                Ok(dispatched) if dispatched > 0 => {
                    info!(dispatched, "Upload-gap sweep dispatched jobs");
                }
                Ok(_) => {}
                Err(e) => error!("Upload-gap sweep failed: {e}"),
            }
        }
    }

    /// One sweep over incomplete, unleased jobs
    pub async fn scan_once(&self) -> JobResult<usize> {
        let candidates = self.store.find_recoverable(self.config.scan_limit).await?;
        let mut retried = 0;

        for mut job in candidates {
            if job.retries_exhausted() {
                // Left in place so an operator can see and intervene
                warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    "Retry budget exhausted; job needs operator attention"
                );
                continue;
            }

            job.retry_count += 1;
            job.last_retry_at = Some(Utc::now());
            if let Err(e) = self.store.update(&job).await {
                warn!(job_id = %job.id, "Failed to stamp retry: {e}");
                continue;
            }

            info!(
                job_id = %job.id,
                retry = job.retry_count,
                "Re-dispatching recoverable job"
            );
            match self.orchestrator.run(&job.id).await {
                Ok(finished) => {
                    retried += 1;
                    if finished.status == JobStatus::Failed {
                        warn!(
                            job_id = %finished.id,
                            error = finished.error.as_deref().unwrap_or(""),
                            "Recovery attempt failed again"
                        );
                    }
                }
                Err(JobError::AlreadyProcessing(_)) => {
                    debug!(job_id = %job.id, "Job was claimed by another worker");
                }
                Err(e) => {
                    warn!(job_id = %job.id, "Recovery attempt failed: {e}");
                }
            }
        }

        Ok(retried)
    }

    /// One sweep over completed uploads with no job record
    pub async fn scan_upload_gaps(&self) -> JobResult<usize> {
        let uploads = self
            .uploads
            .list_completed(self.config.upload_scan_limit)
            .await?;
        let mut dispatched = 0;

        for upload in uploads {
            match self
                .store
                .find_by_subject(&upload.owner_id, &upload.subject_id)
                .await
            {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(subject_id = %upload.subject_id, "Gap lookup failed: {e}");
                    continue;
                }
            }

            // Only dispatch when the bytes actually landed
            if !matches!(self.objects.exists(&upload.storage_key).await, Ok(true)) {
                continue;
            }

            info!(
                subject_id = %upload.subject_id,
                owner_id = %upload.owner_id,
                "Completed upload has no job record; dispatching"
            );
            match self
                .orchestrator
                .dispatch(
                    &upload.subject_id,
                    &upload.owner_id,
                    ProcessingOptions::default(),
                )
                .await
            {
                Ok(_) => dispatched += 1,
                Err(e) => {
                    warn!(subject_id = %upload.subject_id, "Gap dispatch failed: {e}");
                }
            }
        }

        Ok(dispatched)
    }
}
