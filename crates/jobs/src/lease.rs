//! Worker-side lease handling
//!
//! The store performs the actual atomic conditional write; this layer
//! carries the worker identity and timeout so call sites stay small.

use crate::JobResult;
use chrono::Utc;
use media_ingest_storage::JobStore;
use std::sync::Arc;

/// Default lease timeout: a worker silent for this long is considered
/// dead and its jobs become claimable
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Lease operations bound to one worker identity
pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    holder: String,
    timeout_ms: u64,
}

impl LeaseManager {
    /// Create a manager with a fresh worker identity
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, timeout_ms: u64) -> Self {
        Self::with_holder(store, &format!("worker-{}", uuid::Uuid::new_v4()), timeout_ms)
    }

    /// Create a manager with an explicit worker identity
    #[must_use]
    pub fn with_holder(store: Arc<dyn JobStore>, holder: &str, timeout_ms: u64) -> Self {
        Self {
            store,
            holder: holder.to_string(),
            timeout_ms,
        }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to claim the job. Returns false when an unexpired lease is held
    /// by another worker.
    pub async fn acquire(&self, job_id: &str) -> JobResult<bool> {
        Ok(self
            .store
            .try_acquire_lease(job_id, &self.holder, self.timeout_ms)
            .await?)
    }

    /// Refresh the lease this worker holds, restarting its timeout.
    /// Returns false when the lease has been lost to another worker.
    pub async fn renew(&self, job_id: &str) -> JobResult<bool> {
        Ok(self
            .store
            .renew_lease(job_id, &self.holder, self.timeout_ms)
            .await?)
    }

    /// Clear the lease. Safe to call when no lease is held.
    pub async fn release(&self, job_id: &str) -> JobResult<()> {
        Ok(self.store.release_lease(job_id).await?)
    }

    /// Whether anyone currently holds an unexpired lease on the job
    pub async fn is_locked(&self, job_id: &str) -> JobResult<bool> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| crate::JobError::NotFound(job_id.to_string()))?;
        Ok(job.is_leased(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_ingest_common::ProcessingOptions;
    use media_ingest_storage::{JobRecord, MemoryJobStore};

    async fn seeded_store() -> (Arc<MemoryJobStore>, JobRecord) {
        let store = Arc::new(MemoryJobStore::new());
        let job = JobRecord::new("subject-1", "owner-1", ProcessingOptions::default(), 3);
        store.insert(&job).await.unwrap();
        (store, job)
    }

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let (store, job) = seeded_store().await;
        let first = LeaseManager::with_holder(store.clone(), "worker-a", 60_000);
        let second = LeaseManager::with_holder(store, "worker-b", 60_000);

        assert!(first.acquire(&job.id).await.unwrap());
        assert!(!second.acquire(&job.id).await.unwrap());
        assert!(second.is_locked(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_the_job() {
        let (store, job) = seeded_store().await;
        let first = LeaseManager::with_holder(store.clone(), "worker-a", 60_000);
        let second = LeaseManager::with_holder(store, "worker-b", 60_000);

        assert!(first.acquire(&job.id).await.unwrap());
        first.release(&job.id).await.unwrap();
        assert!(!first.is_locked(&job.id).await.unwrap());
        assert!(second.acquire(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_restarts_the_timeout() {
        let (store, job) = seeded_store().await;
        // Acquired with a zero timeout, the lease is instantly stale
        let holder = LeaseManager::with_holder(store.clone(), "worker-a", 0);
        let rival = LeaseManager::with_holder(store.clone(), "worker-b", 60_000);

        assert!(holder.acquire(&job.id).await.unwrap());

        // Renewing through a manager with a live timeout keeps rivals out
        let refreshed = LeaseManager::with_holder(store, "worker-a", 60_000);
        assert!(refreshed.renew(&job.id).await.unwrap());
        assert!(!rival.acquire(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_fails_for_lost_lease() {
        let (store, job) = seeded_store().await;
        let dead = LeaseManager::with_holder(store.clone(), "worker-dead", 0);
        let live = LeaseManager::with_holder(store, "worker-live", 60_000);

        assert!(dead.acquire(&job.id).await.unwrap());
        assert!(live.acquire(&job.id).await.unwrap());

        // The original holder was displaced; its renewal must not succeed
        assert!(!dead.renew(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_claimable() {
        let (store, job) = seeded_store().await;
        let dead = LeaseManager::with_holder(store.clone(), "worker-dead", 0);
        let live = LeaseManager::with_holder(store, "worker-live", 60_000);

        assert!(dead.acquire(&job.id).await.unwrap());
        assert!(live.acquire(&job.id).await.unwrap());
    }
}
