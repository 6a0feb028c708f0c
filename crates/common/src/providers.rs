//! External AI provider interfaces
//!
//! Transcription and embedding run in external services. The engine only
//! depends on these narrow contracts; concrete clients are chosen at
//! process startup.

use crate::{Metadata, Result, SourceKind, Transcript};
use serde::{Deserialize, Serialize};

/// Options forwarded to the transcription backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscribeOptions {
    /// Language hint (None = auto-detect)
    pub language: Option<String>,
    /// Request speaker diarization
    pub diarize: bool,
}

/// Transcription backend
#[async_trait::async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Transcribe raw media bytes into a timed transcript
    async fn transcribe(
        &self,
        media: &[u8],
        source_id: &str,
        kind: SourceKind,
        options: &TranscribeOptions,
    ) -> Result<Transcript>;
}

/// One text to embed, keyed by a caller-chosen stable id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingInput {
    pub id: String,
    pub text: String,
}

/// An embedded record ready for vector storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    /// Same id as the input; vector upserts are idempotent by this id
    pub id: String,
    /// High-dimensional embedding
    pub embedding: Vec<f32>,
    /// Associated metadata (time span, segment ids, ownership)
    #[serde(default)]
    pub metadata: Metadata,
}

/// Embedding backend
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, preserving input ids
    async fn embed(&self, inputs: &[EmbeddingInput]) -> Result<Vec<EmbeddedRecord>>;
}
