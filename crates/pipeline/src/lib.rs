//! Per-part processing pipeline
//!
//! A part flows through a fixed, ordered set of steps: transcribe, chunk
//! and embed, store vectors. The step set is selected once from the job's
//! frozen options, so a resumed run rebuilds exactly the pipeline the
//! original dispatch ran. Every step is an idempotent no-op when its input
//! is missing or its output is already present, which is what makes
//! re-running a partially processed part safe.

use std::sync::Arc;
use tracing::{debug, info, warn};

use media_ingest_common::{
    EmbeddedRecord, EmbeddingInput, EmbeddingProvider, ProcessingOptions, Result, SourceKind,
    TranscribeOptions, Transcript, TranscriptionProvider,
};
use media_ingest_storage::{ObjectStorage, TranscriptStore, VectorStore};

pub mod chunker;
pub mod providers;

pub use chunker::{chunk_transcript, TextChunk};
pub use providers::{HttpEmbeddingProvider, HttpTranscriptionProvider, ProviderConfig};

/// Shared collaborators the steps run against, wired once at startup
#[derive(Clone)]
pub struct PipelineEnv {
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub vector_store: Arc<dyn VectorStore>,
    pub transcript_store: Arc<dyn TranscriptStore>,
    pub object_storage: Arc<dyn ObjectStorage>,
}

/// Ephemeral state for one part's trip through the pipeline.
///
/// Constructed just before the run, dropped right after; nothing in here
/// survives a crash, which is why each step persists its own output.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub job_id: String,
    pub subject_id: String,
    pub owner_id: String,
    /// Object storage key of the media bytes for this part
    pub source_key: String,
    pub source_kind: SourceKind,
    pub part_index: u32,
    /// Time span of this part within the full asset, seconds
    pub part_span: (f64, f64),
    pub options: ProcessingOptions,
    /// Set by the transcribe step
    pub transcript: Option<Transcript>,
    /// Set by the chunk-and-embed step
    pub embedded: Vec<EmbeddedRecord>,
}

impl ProcessingContext {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: &str,
        subject_id: &str,
        owner_id: &str,
        source_key: &str,
        source_kind: SourceKind,
        part_index: u32,
        part_span: (f64, f64),
        options: ProcessingOptions,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            subject_id: subject_id.to_string(),
            owner_id: owner_id.to_string(),
            source_key: source_key.to_string(),
            source_kind,
            part_index,
            part_span,
            options,
            transcript: None,
            embedded: Vec::new(),
        }
    }
}

/// The closed set of pipeline steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    /// Produce a transcript for the part's media
    Transcribe,
    /// Chunk the transcript text and embed the chunks
    ChunkAndEmbed,
    /// Upsert the embedded chunks into the vector store
    StoreVectors,
}

impl PipelineStep {
    /// Human-readable step name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::ChunkAndEmbed => "chunk_and_embed",
            Self::StoreVectors => "store_vectors",
        }
    }

    /// Run this step, threading the context through
    pub async fn run(
        &self,
        env: &PipelineEnv,
        ctx: ProcessingContext,
    ) -> Result<ProcessingContext> {
        match self {
            Self::Transcribe => run_transcribe(env, ctx).await,
            Self::ChunkAndEmbed => run_chunk_and_embed(env, ctx).await,
            Self::StoreVectors => run_store_vectors(env, ctx).await,
        }
    }
}

/// Select the step sequence from a frozen options snapshot
#[must_use]
pub fn build_pipeline(options: &ProcessingOptions) -> Vec<PipelineStep> {
    let mut steps = Vec::with_capacity(3);
    if !options.skip_transcription {
        steps.push(PipelineStep::Transcribe);
    }
    if !options.skip_embeddings {
        steps.push(PipelineStep::ChunkAndEmbed);
    }
    if !options.skip_vector_store {
        steps.push(PipelineStep::StoreVectors);
    }
    steps
}

/// Run the full step sequence for one part
pub async fn run_pipeline(env: &PipelineEnv, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
    for step in build_pipeline(&ctx.options) {
        debug!(
            job_id = %ctx.job_id,
            part_index = ctx.part_index,
            step = step.name(),
            "Running pipeline step"
        );
        ctx = step.run(env, ctx).await?;
    }
    Ok(ctx)
}

async fn run_transcribe(env: &PipelineEnv, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
    if ctx.transcript.is_some() {
        debug!(job_id = %ctx.job_id, part_index = ctx.part_index, "Transcript already present, skipping");
        return Ok(ctx);
    }

    // A previously persisted transcript for this exact media object makes
    // re-running cheap; sub-parts have their own keys and never alias.
    match env.transcript_store.load(&ctx.job_id, &ctx.source_key).await {
        Ok(Some(saved)) => {
            info!(
                job_id = %ctx.job_id,
                source_key = %ctx.source_key,
                segments = saved.segments.len(),
                "Reusing persisted transcript"
            );
            ctx.transcript = Some(saved);
            return Ok(ctx);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(job_id = %ctx.job_id, part_index = ctx.part_index, "Transcript lookup failed: {e}");
        }
    }

    let media = env.object_storage.read(&ctx.source_key).await?;
    let transcribe_options = TranscribeOptions {
        language: ctx.options.language.clone(),
        diarize: ctx.options.diarize,
    };
    let transcript = env
        .transcription
        .transcribe(&media, &ctx.source_key, ctx.source_kind, &transcribe_options)
        .await?;

    info!(
        job_id = %ctx.job_id,
        part_index = ctx.part_index,
        segments = transcript.segments.len(),
        "Transcription complete"
    );

    // Persistence is best-effort; the in-memory transcript carries the run
    if let Err(e) = env
        .transcript_store
        .save(&ctx.job_id, &ctx.source_key, &transcript)
        .await
    {
        warn!(job_id = %ctx.job_id, part_index = ctx.part_index, "Failed to persist transcript: {e}");
    }

    ctx.transcript = Some(transcript);
    Ok(ctx)
}

async fn run_chunk_and_embed(
    env: &PipelineEnv,
    mut ctx: ProcessingContext,
) -> Result<ProcessingContext> {
    if !ctx.embedded.is_empty() {
        debug!(job_id = %ctx.job_id, part_index = ctx.part_index, "Embeddings already present, skipping");
        return Ok(ctx);
    }
    let Some(transcript) = ctx.transcript.as_ref() else {
        debug!(job_id = %ctx.job_id, part_index = ctx.part_index, "No transcript, skipping embed");
        return Ok(ctx);
    };
    if transcript.is_empty() {
        return Ok(ctx);
    }

    let chunks = chunk_transcript(transcript, ctx.options.chunk_char_budget);
    if chunks.is_empty() {
        return Ok(ctx);
    }

    let inputs: Vec<EmbeddingInput> = chunks
        .iter()
        .map(|c| EmbeddingInput {
            id: c.id.clone(),
            text: c.text.clone(),
        })
        .collect();

    let mut records = env.embedding.embed(&inputs).await?;

    // Attach chunk provenance so search hits can be located in the media
    for record in &mut records {
        if let Some(chunk) = chunks.iter().find(|c| c.id == record.id) {
            record
                .metadata
                .insert("part_index".to_string(), ctx.part_index.to_string());
            record
                .metadata
                .insert("start_time_sec".to_string(), chunk.start_time_sec.to_string());
            record
                .metadata
                .insert("end_time_sec".to_string(), chunk.end_time_sec.to_string());
            record
                .metadata
                .insert("segment_ids".to_string(), chunk.segment_ids.join(","));
            record.metadata.insert("text".to_string(), chunk.text.clone());
        }
    }

    info!(
        job_id = %ctx.job_id,
        part_index = ctx.part_index,
        chunks = chunks.len(),
        "Embedded transcript chunks"
    );

    ctx.embedded = records;
    Ok(ctx)
}

async fn run_store_vectors(
    env: &PipelineEnv,
    mut ctx: ProcessingContext,
) -> Result<ProcessingContext> {
    if ctx.embedded.is_empty() {
        debug!(job_id = %ctx.job_id, part_index = ctx.part_index, "No embeddings, skipping vector store");
        return Ok(ctx);
    }

    for record in &mut ctx.embedded {
        record
            .metadata
            .insert("owner_id".to_string(), ctx.owner_id.clone());
        record
            .metadata
            .insert("subject_id".to_string(), ctx.subject_id.clone());
    }

    env.vector_store.upsert_many(&ctx.embedded).await?;

    info!(
        job_id = %ctx.job_id,
        part_index = ctx.part_index,
        records = ctx.embedded.len(),
        "Stored embedded chunks"
    );
    Ok(ctx)
}
