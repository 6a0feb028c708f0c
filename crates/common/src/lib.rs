//! Common types and provider interfaces for the media ingest system

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod providers;

pub use providers::{
    EmbeddedRecord, EmbeddingInput, EmbeddingProvider, TranscribeOptions, TranscriptionProvider,
};

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Part {index} exceeds size ceiling after re-extraction: {size} bytes (max: {max})")]
    PartTooLarge { index: u32, size: u64, max: u64 },

    #[error("Transcoder error: {0}")]
    TranscoderError(String),

    #[error("Transcription error: {0}")]
    TranscriptionError(String),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Kind of media source being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Audio,
    Video,
}

impl SourceKind {
    /// Infer the source kind from a MIME type, defaulting to audio
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            SourceKind::Video
        } else {
            SourceKind::Audio
        }
    }
}

/// A single timed segment of a transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Stable segment identifier, unique within the transcript
    pub id: String,
    /// Speaker label when diarization ran
    pub speaker_id: Option<String>,
    /// Segment text
    pub text: String,
    /// Segment start time in seconds
    pub start_time_sec: f64,
    /// Segment end time in seconds
    pub end_time_sec: f64,
}

/// Complete transcript for one media part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Ordered segments with timestamps
    pub segments: Vec<TranscriptSegment>,
    /// Detected or requested language code
    pub language: Option<String>,
    /// Distinct speaker labels present in the segments
    pub speakers: Vec<String>,
}

impl Transcript {
    /// Total spoken duration covered by the segments
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.segments.last().map_or(0.0, |s| s.end_time_sec)
    }

    /// Concatenated text of all segments
    #[must_use]
    pub fn full_text(&self) -> String {
        let mut text = String::new();
        for segment in &self.segments {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(segment.text.trim());
        }
        text
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Frozen per-job configuration snapshot.
///
/// Captured once at job creation and re-read identically on every resume,
/// so a resumed run reconstructs the same pipeline shape as the original
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Skip the transcription step
    #[serde(default)]
    pub skip_transcription: bool,

    /// Skip the chunk-and-embed step
    #[serde(default)]
    pub skip_embeddings: bool,

    /// Skip the vector store step
    #[serde(default)]
    pub skip_vector_store: bool,

    /// Requested transcript language (None = auto-detect)
    #[serde(default)]
    pub language: Option<String>,

    /// Request speaker diarization
    #[serde(default)]
    pub diarize: bool,

    /// Character budget per embedded text chunk
    #[serde(default = "default_chunk_chars")]
    pub chunk_char_budget: usize,

    /// Kind of the source media, captured at dispatch so a resumed run
    /// does not need to re-probe the asset
    #[serde(default = "default_source_kind")]
    pub source_kind: SourceKind,
}

fn default_chunk_chars() -> usize {
    2000
}

fn default_source_kind() -> SourceKind {
    SourceKind::Audio
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            skip_transcription: false,
            skip_embeddings: false,
            skip_vector_store: false,
            language: None,
            diarize: false,
            chunk_char_budget: default_chunk_chars(),
            source_kind: default_source_kind(),
        }
    }
}

/// Free-form string metadata attached to stored records
pub type Metadata = HashMap<String, String>;
