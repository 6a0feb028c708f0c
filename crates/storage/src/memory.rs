//! In-memory backends
//!
//! Used by tests and single-node deployments. `MemoryJobStore` performs
//! the lease check-and-write under one write lock, giving the same
//! atomicity guarantee as the conditional `UPDATE` in the Postgres store.

use crate::job_store::{JobRecord, JobStatus, JobStore, Lease, UploadIndex, UploadRecord};
use crate::transcript_store::TranscriptStore;
use crate::vector_store::{SearchHit, VectorStore};
use crate::{ObjectStorage, StorageError, StorageResult};
use chrono::Utc;
use media_ingest_common::{EmbeddedRecord, Metadata, Transcript};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory job store
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::Conflict(format!(
                "Job already exists: {}",
                job.id
            )));
        }
        // Same uniqueness guarantee as the Postgres index on
        // (owner_id, idempotency_key); dispatch races resolve to Conflict
        if jobs
            .values()
            .any(|j| j.owner_id == job.owner_id && j.idempotency_key == job.idempotency_key)
        {
            return Err(StorageError::Conflict(format!(
                "Job already exists for idempotency key: {}",
                job.idempotency_key
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> StorageResult<Option<JobRecord>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.owner_id == owner_id && j.idempotency_key == key)
            .cloned())
    }

    async fn find_by_subject(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> StorageResult<Option<JobRecord>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.owner_id == owner_id && j.subject_id == subject_id)
            .cloned())
    }

    async fn update(&self, job: &JobRecord) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        let Some(existing) = jobs.get_mut(&job.id) else {
            return Err(StorageError::NotFound(job.id.clone()));
        };
        let lease = existing.lease.clone();
        *existing = job.clone();
        // Lease fields move only through the lease operations
        existing.lease = lease;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        timeout_ms: u64,
    ) -> StorageResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Err(StorageError::NotFound(id.to_string()));
        };

        let now = Utc::now();
        if job.lease.as_ref().is_some_and(|l| !l.is_expired(now)) {
            return Ok(false);
        }

        job.lease = Some(Lease {
            holder: holder.to_string(),
            acquired_at: now,
            timeout_ms,
        });
        Ok(true)
    }

    async fn renew_lease(&self, id: &str, holder: &str, timeout_ms: u64) -> StorageResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Err(StorageError::NotFound(id.to_string()));
        };

        match job.lease.as_mut() {
            Some(lease) if lease.holder == holder => {
                lease.acquired_at = Utc::now();
                lease.timeout_ms = timeout_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, id: &str) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(id) {
            job.lease = None;
        }
        Ok(())
    }

    async fn find_recoverable(&self, limit: usize) -> StorageResult<Vec<JobRecord>> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        let mut candidates: Vec<JobRecord> = jobs
            .values()
            .filter(|j| {
                matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Processing | JobStatus::Failed
                ) && !j.is_leased(now)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|j| j.updated_at);
        candidates.truncate(limit);
        Ok(candidates)
    }
}

/// In-memory object storage
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn write(
        &self,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> StorageResult<String> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(key.to_string())
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|d| d.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory vector store; upserts overwrite by record id
#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<HashMap<String, EmbeddedRecord>>,
}

impl MemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct records stored
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot of one record, for assertions
    pub async fn get(&self, id: &str) -> Option<EmbeddedRecord> {
        self.records.read().await.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_many(&self, records: &[EmbeddedRecord]) -> StorageResult<()> {
        let mut stored = self.records.write().await;
        for record in records {
            stored.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        _query: &[f32],
        top_k: usize,
        filter: Option<Metadata>,
    ) -> StorageResult<Vec<SearchHit>> {
        // Cosine ranking is the real store's concern; in memory, filter
        // and return in insertion-id order for deterministic tests.
        let records = self.records.read().await;
        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|r| {
                filter.as_ref().is_none_or(|f| {
                    f.iter().all(|(k, v)| r.metadata.get(k) == Some(v))
                })
            })
            .map(|r| SearchHit {
                id: r.id.clone(),
                score: 1.0,
                metadata: r.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// In-memory transcript store
#[derive(Default)]
pub struct MemoryTranscriptStore {
    transcripts: RwLock<HashMap<(String, String), Transcript>>,
}

impl MemoryTranscriptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn save(
        &self,
        job_id: &str,
        source_key: &str,
        transcript: &Transcript,
    ) -> StorageResult<()> {
        self.transcripts
            .write()
            .await
            .insert((job_id.to_string(), source_key.to_string()), transcript.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str, source_key: &str) -> StorageResult<Option<Transcript>> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(&(job_id.to_string(), source_key.to_string()))
            .cloned())
    }
}

/// In-memory upload index
#[derive(Default)]
pub struct MemoryUploadIndex {
    uploads: RwLock<Vec<UploadRecord>>,
}

impl MemoryUploadIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, upload: UploadRecord) {
        self.uploads.write().await.push(upload);
    }
}

#[async_trait::async_trait]
impl UploadIndex for MemoryUploadIndex {
    async fn list_completed(&self, limit: usize) -> StorageResult<Vec<UploadRecord>> {
        let uploads = self.uploads.read().await;
        Ok(uploads.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_ingest_common::ProcessingOptions;
    use std::sync::Arc;

    fn job() -> JobRecord {
        JobRecord::new("subject-1", "owner-1", ProcessingOptions::default(), 3)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_idempotency_key() {
        let store = MemoryJobStore::new();
        store.insert(&job()).await.unwrap();

        // A racing dispatch builds its own record for the same pair; the
        // second insert must lose, same as under the Postgres unique index
        let result = store.insert(&job()).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let store = MemoryJobStore::new();
        let record = job();
        store.insert(&record).await.unwrap();

        let first = store
            .try_acquire_lease(&record.id, "worker-a", 60_000)
            .await
            .unwrap();
        let second = store
            .try_acquire_lease(&record.id, "worker-b", 60_000)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        let record = job();
        store.insert(&record).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire_lease(&id, &format!("worker-{i}"), 60_000)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_stale_lease_takeover() {
        let store = MemoryJobStore::new();
        let record = job();
        store.insert(&record).await.unwrap();

        // Zero timeout: the lease is expired the moment it is written
        assert!(store
            .try_acquire_lease(&record.id, "worker-a", 0)
            .await
            .unwrap());
        assert!(store
            .try_acquire_lease(&record.id, "worker-b", 60_000)
            .await
            .unwrap());

        let held = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(held.lease.unwrap().holder, "worker-b");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryJobStore::new();
        let record = job();
        store.insert(&record).await.unwrap();

        store.release_lease(&record.id).await.unwrap();
        store
            .try_acquire_lease(&record.id, "worker-a", 60_000)
            .await
            .unwrap();
        store.release_lease(&record.id).await.unwrap();
        store.release_lease(&record.id).await.unwrap();

        assert!(store.get(&record.id).await.unwrap().unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_update_does_not_touch_lease() {
        let store = MemoryJobStore::new();
        let mut record = job();
        store.insert(&record).await.unwrap();
        store
            .try_acquire_lease(&record.id, "worker-a", 60_000)
            .await
            .unwrap();

        // The caller's copy has no lease, but update must not clear it
        record.advance_progress(50);
        store.update(&record).await.unwrap();

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 50);
        assert_eq!(stored.lease.unwrap().holder, "worker-a");
    }

    #[tokio::test]
    async fn test_find_recoverable_skips_leased_and_completed() {
        let store = MemoryJobStore::new();

        let unleased = job();
        store.insert(&unleased).await.unwrap();

        let mut done = JobRecord::new("subject-2", "owner-1", ProcessingOptions::default(), 3);
        done.status = JobStatus::Completed;
        store.insert(&done).await.unwrap();

        let leased = JobRecord::new("subject-3", "owner-1", ProcessingOptions::default(), 3);
        store.insert(&leased).await.unwrap();
        store
            .try_acquire_lease(&leased.id, "worker-a", 60_000)
            .await
            .unwrap();

        let recoverable = store.find_recoverable(10).await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].id, unleased.id);
    }

    #[tokio::test]
    async fn test_vector_upsert_overwrites_by_id() {
        let store = MemoryVectorStore::new();
        let record = EmbeddedRecord {
            id: "chunk-1".to_string(),
            embedding: vec![0.1, 0.2],
            metadata: Metadata::new(),
        };
        store.upsert_many(&[record.clone()]).await.unwrap();
        store.upsert_many(&[record]).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
