//! `PostgreSQL` backends for the job store, transcript store, and upload
//! index
//!
//! The lease acquire is a single conditional `UPDATE`: the absent-or-expired
//! check and the lease write happen in one statement, so concurrent workers
//! racing on the same job resolve at the database.

use crate::job_store::{JobRecord, JobStatus, JobStore, Lease, UploadIndex, UploadRecord};
use crate::transcript_store::TranscriptStore;
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use media_ingest_common::Transcript;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB")
                .unwrap_or_else(|_| "media_ingest".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

async fn connect(config: &PostgresConfig) -> StorageResult<Client> {
    let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
        .await
        .map_err(|e| StorageError::PostgresError(e.to_string()))?;

    // Spawn connection in background
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

fn pg_err(e: tokio_postgres::Error) -> StorageError {
    StorageError::PostgresError(e.to_string())
}

/// Job store backed by `PostgreSQL`
pub struct PostgresJobStore {
    client: Client,
}

const JOB_COLUMNS: &str = "id, subject_id, owner_id, idempotency_key, status, progress, \
     part_count, processed_parts, resume_cursor, lease_holder, lease_acquired_at, \
     lease_timeout_ms, retry_count, max_retries, last_retry_at, options, error, \
     created_at, started_at, completed_at, updated_at";

impl PostgresJobStore {
    /// Connect and ensure the `jobs` table exists
    pub async fn new(config: &PostgresConfig) -> StorageResult<Self> {
        let store = Self {
            client: connect(config).await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    subject_id TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    idempotency_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    progress SMALLINT NOT NULL,
                    part_count INTEGER NOT NULL,
                    processed_parts JSONB NOT NULL,
                    resume_cursor BIGINT NOT NULL,
                    lease_holder TEXT,
                    lease_acquired_at TIMESTAMP WITH TIME ZONE,
                    lease_timeout_ms BIGINT,
                    retry_count INTEGER NOT NULL,
                    max_retries INTEGER NOT NULL,
                    last_retry_at TIMESTAMP WITH TIME ZONE,
                    options JSONB NOT NULL,
                    error TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    started_at TIMESTAMP WITH TIME ZONE,
                    completed_at TIMESTAMP WITH TIME ZONE,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL
                )
                ",
                &[],
            )
            .await
            .map_err(pg_err)?;

        self.client
            .execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency \
                 ON jobs(owner_id, idempotency_key)",
                &[],
            )
            .await
            .map_err(pg_err)?;

        self.client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_jobs_subject ON jobs(owner_id, subject_id)",
                &[],
            )
            .await
            .map_err(pg_err)?;

        self.client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_jobs_recovery ON jobs(status, updated_at)",
                &[],
            )
            .await
            .map_err(pg_err)?;

        tracing::info!("jobs schema initialized");
        Ok(())
    }

    fn row_to_job(row: &Row) -> StorageResult<JobRecord> {
        let status: String = row.get(4);
        let status = JobStatus::parse(&status)?;

        let processed_parts: BTreeSet<u32> = serde_json::from_value(row.get(7))?;
        let options = serde_json::from_value(row.get(15))?;

        let lease = match (
            row.get::<_, Option<String>>(9),
            row.get::<_, Option<DateTime<Utc>>>(10),
            row.get::<_, Option<i64>>(11),
        ) {
            (Some(holder), Some(acquired_at), Some(timeout_ms)) => Some(Lease {
                holder,
                acquired_at,
                timeout_ms: timeout_ms.max(0) as u64,
            }),
            _ => None,
        };

        Ok(JobRecord {
            id: row.get(0),
            subject_id: row.get(1),
            owner_id: row.get(2),
            idempotency_key: row.get(3),
            status,
            progress: row.get::<_, i16>(5).clamp(0, 100) as u8,
            part_count: row.get::<_, i32>(6).max(0) as u32,
            processed_parts,
            resume_cursor: row.get(8),
            lease,
            retry_count: row.get::<_, i32>(12).max(0) as u32,
            max_retries: row.get::<_, i32>(13).max(0) as u32,
            last_retry_at: row.get(14),
            options,
            error: row.get(16),
            created_at: row.get(17),
            started_at: row.get(18),
            completed_at: row.get(19),
            updated_at: row.get(20),
        })
    }

    async fn query_one_job(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> StorageResult<Option<JobRecord>> {
        let row = self.client.query_opt(sql, params).await.map_err(pg_err)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &JobRecord) -> StorageResult<()> {
        let processed_parts = serde_json::to_value(&job.processed_parts)?;
        let options = serde_json::to_value(&job.options)?;

        self.client
            .execute(
                r"
                INSERT INTO jobs
                (id, subject_id, owner_id, idempotency_key, status, progress,
                 part_count, processed_parts, resume_cursor, retry_count,
                 max_retries, last_retry_at, options, error, created_at,
                 started_at, completed_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, $18)
                ",
                &[
                    &job.id,
                    &job.subject_id,
                    &job.owner_id,
                    &job.idempotency_key,
                    &job.status.as_str(),
                    &i16::from(job.progress),
                    &(job.part_count as i32),
                    &processed_parts,
                    &job.resume_cursor,
                    &(job.retry_count as i32),
                    &(job.max_retries as i32),
                    &job.last_retry_at,
                    &options,
                    &job.error,
                    &job.created_at,
                    &job.started_at,
                    &job.completed_at,
                    &job.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    StorageError::Conflict(format!("Job already exists: {}", job.id))
                } else {
                    pg_err(e)
                }
            })?;

        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>> {
        self.query_one_job(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"),
            &[&id],
        )
        .await
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> StorageResult<Option<JobRecord>> {
        self.query_one_job(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE owner_id = $1 AND idempotency_key = $2"
            ),
            &[&owner_id, &key],
        )
        .await
    }

    async fn find_by_subject(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> StorageResult<Option<JobRecord>> {
        self.query_one_job(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE owner_id = $1 AND subject_id = $2 \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            &[&owner_id, &subject_id],
        )
        .await
    }

    async fn update(&self, job: &JobRecord) -> StorageResult<()> {
        let processed_parts = serde_json::to_value(&job.processed_parts)?;
        let options = serde_json::to_value(&job.options)?;

        let updated = self
            .client
            .execute(
                r"
                UPDATE jobs SET
                    status = $2,
                    progress = $3,
                    part_count = $4,
                    processed_parts = $5,
                    resume_cursor = $6,
                    retry_count = $7,
                    max_retries = $8,
                    last_retry_at = $9,
                    options = $10,
                    error = $11,
                    started_at = $12,
                    completed_at = $13,
                    updated_at = NOW()
                WHERE id = $1
                ",
                &[
                    &job.id,
                    &job.status.as_str(),
                    &i16::from(job.progress),
                    &(job.part_count as i32),
                    &processed_parts,
                    &job.resume_cursor,
                    &(job.retry_count as i32),
                    &(job.max_retries as i32),
                    &job.last_retry_at,
                    &options,
                    &job.error,
                    &job.started_at,
                    &job.completed_at,
                ],
            )
            .await
            .map_err(pg_err)?;

        if updated == 0 {
            return Err(StorageError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        timeout_ms: u64,
    ) -> StorageResult<bool> {
        let updated = self
            .client
            .execute(
                r"
                UPDATE jobs SET
                    lease_holder = $2,
                    lease_acquired_at = NOW(),
                    lease_timeout_ms = $3
                WHERE id = $1
                  AND (lease_holder IS NULL
                       OR lease_acquired_at
                          + lease_timeout_ms * interval '1 millisecond' <= NOW())
                ",
                &[&id, &holder, &(timeout_ms as i64)],
            )
            .await
            .map_err(pg_err)?;

        if updated == 1 {
            return Ok(true);
        }

        // Distinguish a held lease from a missing record
        let exists = self
            .client
            .query_opt("SELECT 1 FROM jobs WHERE id = $1", &[&id])
            .await
            .map_err(pg_err)?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StorageError::NotFound(id.to_string()))
        }
    }

    async fn renew_lease(&self, id: &str, holder: &str, timeout_ms: u64) -> StorageResult<bool> {
        let updated = self
            .client
            .execute(
                r"
                UPDATE jobs SET
                    lease_acquired_at = NOW(),
                    lease_timeout_ms = $3
                WHERE id = $1 AND lease_holder = $2
                ",
                &[&id, &holder, &(timeout_ms as i64)],
            )
            .await
            .map_err(pg_err)?;

        Ok(updated == 1)
    }

    async fn release_lease(&self, id: &str) -> StorageResult<()> {
        self.client
            .execute(
                "UPDATE jobs SET lease_holder = NULL, lease_acquired_at = NULL, \
                 lease_timeout_ms = NULL WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn find_recoverable(&self, limit: usize) -> StorageResult<Vec<JobRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status IN ('pending', 'processing', 'failed') \
                       AND (lease_holder IS NULL \
                            OR lease_acquired_at \
                               + lease_timeout_ms * interval '1 millisecond' <= NOW()) \
                     ORDER BY updated_at ASC \
                     LIMIT $1"
                ),
                &[&(limit as i64)],
            )
            .await
            .map_err(pg_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }
}

/// Transcript store backed by `PostgreSQL`, one JSONB payload per
/// `(job_id, source_key)`
pub struct PostgresTranscriptStore {
    client: Client,
}

impl PostgresTranscriptStore {
    /// Connect and ensure the `transcripts` table exists
    pub async fn new(config: &PostgresConfig) -> StorageResult<Self> {
        let store = Self {
            client: connect(config).await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS transcripts (
                    job_id TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    saved_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    PRIMARY KEY (job_id, source_key)
                )
                ",
                &[],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TranscriptStore for PostgresTranscriptStore {
    async fn save(
        &self,
        job_id: &str,
        source_key: &str,
        transcript: &Transcript,
    ) -> StorageResult<()> {
        let payload = serde_json::to_value(transcript)?;
        self.client
            .execute(
                r"
                INSERT INTO transcripts (job_id, source_key, payload, saved_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (job_id, source_key) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    saved_at = EXCLUDED.saved_at
                ",
                &[&job_id, &source_key, &payload],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn load(&self, job_id: &str, source_key: &str) -> StorageResult<Option<Transcript>> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM transcripts WHERE job_id = $1 AND source_key = $2",
                &[&job_id, &source_key],
            )
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.get(0))?)),
            None => Ok(None),
        }
    }
}

/// Upload index backed by `PostgreSQL`
pub struct PostgresUploadIndex {
    client: Client,
}

impl PostgresUploadIndex {
    /// Connect and ensure the `uploads` table exists
    pub async fn new(config: &PostgresConfig) -> StorageResult<Self> {
        let store = Self {
            client: connect(config).await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS uploads (
                    owner_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    storage_key TEXT NOT NULL,
                    completed_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    PRIMARY KEY (owner_id, subject_id)
                )
                ",
                &[],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    /// Record a completed upload, overwriting any previous entry for the
    /// same subject
    pub async fn record(&self, upload: &UploadRecord) -> StorageResult<()> {
        self.client
            .execute(
                r"
                INSERT INTO uploads (owner_id, subject_id, storage_key, completed_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (owner_id, subject_id) DO UPDATE SET
                    storage_key = EXCLUDED.storage_key,
                    completed_at = EXCLUDED.completed_at
                ",
                &[
                    &upload.owner_id,
                    &upload.subject_id,
                    &upload.storage_key,
                    &upload.completed_at,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UploadIndex for PostgresUploadIndex {
    async fn list_completed(&self, limit: usize) -> StorageResult<Vec<UploadRecord>> {
        let rows = self
            .client
            .query(
                "SELECT owner_id, subject_id, storage_key, completed_at \
                 FROM uploads ORDER BY completed_at DESC LIMIT $1",
                &[&(limit as i64)],
            )
            .await
            .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|row| UploadRecord {
                owner_id: row.get(0),
                subject_id: row.get(1),
                storage_key: row.get(2),
                completed_at: row.get(3),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "media_ingest");
    }

    #[test]
    fn test_postgres_connection_string() {
        let config = PostgresConfig {
            host: "db.internal".to_string(),
            port: 5433,
            database: "ingest".to_string(),
            user: "svc".to_string(),
            password: "secret".to_string(),
        };

        let conn_str = config.connection_string();
        assert!(conn_str.contains("host=db.internal"));
        assert!(conn_str.contains("port=5433"));
        assert!(conn_str.contains("dbname=ingest"));
    }
}
