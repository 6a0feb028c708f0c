//! Storage layer for the media ingest system
//!
//! This crate provides the interfaces and implementations the job engine
//! coordinates through:
//! - **Object storage (S3/MinIO)**: raw media, extracted parts
//! - **Vector store (Qdrant)**: embedded text chunks for semantic search
//! - **Job store (`PostgreSQL` or in-memory)**: job records, leases,
//!   recovery queries
//! - **Transcript store (`PostgreSQL` or in-memory)**: per-part transcripts
//!
//! The job store is the single shared mutable resource in the system; its
//! lease write is a single atomic conditional update so two workers can
//! never both acquire an unexpired lease.

use media_ingest_common::ProcessingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod job_store;
pub mod memory;
pub mod object_store;
pub mod postgres;
pub mod transcript_store;
pub mod vector_store;

pub use job_store::{JobRecord, JobStatus, JobStore, Lease, UploadIndex, UploadRecord};
pub use memory::{
    MemoryJobStore, MemoryObjectStorage, MemoryTranscriptStore, MemoryUploadIndex,
    MemoryVectorStore,
};
pub use object_store::{ObjectStorage, S3Config, S3ObjectStorage};
pub use postgres::{PostgresConfig, PostgresJobStore, PostgresTranscriptStore, PostgresUploadIndex};
pub use transcript_store::TranscriptStore;
pub use vector_store::{QdrantConfig, QdrantVectorStore, SearchHit, VectorStore};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Qdrant error: {0}")]
    QdrantError(String),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for ProcessingError {
    fn from(err: StorageError) -> Self {
        ProcessingError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Complete storage configuration for all backends
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// S3/MinIO configuration for object storage
    #[serde(default)]
    pub s3: S3Config,

    /// Qdrant configuration for vector storage
    #[serde(default)]
    pub qdrant: QdrantConfig,

    /// `PostgreSQL` configuration for the job and transcript stores
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.s3.bucket, "media-ingest");
        assert_eq!(config.qdrant.collection, "media_chunks");
        assert_eq!(config.postgres.database, "media_ingest");
    }

    #[test]
    fn test_storage_error_maps_to_processing_error() {
        let err: ProcessingError = StorageError::NotFound("abc".to_string()).into();
        assert!(matches!(err, ProcessingError::StorageError(_)));
    }
}
