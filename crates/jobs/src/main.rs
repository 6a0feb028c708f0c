/// Worker binary: wires the storage backends, providers, and chunking
/// engine together and runs the recovery loop. An optional subject/owner
/// pair on the command line dispatches one job immediately before the
/// loop takes over.
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use media_ingest_chunking::{ChunkingEngine, FfmpegTranscoder};
use media_ingest_common::ProcessingOptions;
use media_ingest_jobs::{EngineConfig, JobOrchestrator, RecoveryConfig, RecoveryLoop};
use media_ingest_pipeline::{HttpEmbeddingProvider, HttpTranscriptionProvider, PipelineEnv, ProviderConfig};
use media_ingest_storage::{
    JobStore, ObjectStorage, PostgresJobStore, PostgresTranscriptStore, PostgresUploadIndex,
    QdrantVectorStore, S3ObjectStorage, StorageConfig, UploadIndex,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Media ingest worker v{}", env!("CARGO_PKG_VERSION"));

    let storage_config = StorageConfig::default();
    let provider_config = ProviderConfig::default();
    let engine_config = EngineConfig::default();
    let recovery_config = RecoveryConfig::default();

    // Any backend failing to come up is fatal; a worker without its
    // collaborators can only produce failed jobs.
    let objects: Arc<dyn ObjectStorage> = Arc::new(
        S3ObjectStorage::new(storage_config.s3.clone())
            .await
            .context("S3 object storage")?,
    );
    let vector_store = Arc::new(
        QdrantVectorStore::new(storage_config.qdrant.clone())
            .await
            .context("Qdrant vector store")?,
    );
    let job_store: Arc<dyn JobStore> = Arc::new(
        PostgresJobStore::new(&storage_config.postgres)
            .await
            .context("PostgreSQL job store")?,
    );
    let transcript_store = Arc::new(
        PostgresTranscriptStore::new(&storage_config.postgres)
            .await
            .context("PostgreSQL transcript store")?,
    );
    let uploads: Arc<dyn UploadIndex> = Arc::new(
        PostgresUploadIndex::new(&storage_config.postgres)
            .await
            .context("PostgreSQL upload index")?,
    );

    let env = PipelineEnv {
        transcription: Arc::new(
            HttpTranscriptionProvider::new(&provider_config).context("transcription client")?,
        ),
        embedding: Arc::new(
            HttpEmbeddingProvider::new(&provider_config).context("embedding client")?,
        ),
        vector_store,
        transcript_store,
        object_storage: objects.clone(),
    };

    let chunking = ChunkingEngine::new(FfmpegTranscoder::default(), engine_config.chunking.clone());
    let orchestrator = Arc::new(JobOrchestrator::new(
        job_store.clone(),
        env,
        chunking,
        engine_config,
    ));
    info!(worker_id = orchestrator.worker_id(), "Worker ready");

    // One-shot dispatch: media-ingest-worker <subject_id> <owner_id>.
    // Processing runs in the background while the recovery loop takes over.
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 3 {
        let job = orchestrator
            .dispatch(&args[1], &args[2], ProcessingOptions::default())
            .await
            .with_context(|| format!("dispatch for subject {}", args[1]))?;
        info!(job_id = %job.id, status = job.status.as_str(), "Dispatched");
    }

    let recovery = RecoveryLoop::new(
        orchestrator,
        job_store,
        uploads,
        objects,
        recovery_config,
    );
    recovery.run().await;

    Ok(())
}
