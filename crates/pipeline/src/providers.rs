//! HTTP clients for the external transcription and embedding services
//!
//! Both services are reached over plain JSON/HTTPS; the wire shapes mirror
//! the crate's own `Transcript` and `EmbeddedRecord` types. Anything
//! fancier (batching windows, retry policies) belongs to the recovery
//! loop, not these clients.

use media_ingest_common::{
    EmbeddedRecord, EmbeddingInput, EmbeddingProvider, ProcessingError, Result, SourceKind,
    TranscribeOptions, Transcript, TranscriptionProvider,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint configuration for both provider clients
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the transcription service
    pub transcription_url: String,

    /// Base URL of the embedding service
    pub embedding_url: String,

    /// Bearer token sent to both services
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            transcription_url: std::env::var("TRANSCRIPTION_API_URL")
                .unwrap_or_else(|_| "http://localhost:8200".to_string()),
            embedding_url: std::env::var("EMBEDDING_API_URL")
                .unwrap_or_else(|_| "http://localhost:8300".to_string()),
            api_key: std::env::var("PROVIDER_API_KEY").ok(),
            timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }
}

fn build_client(config: &ProviderConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ProcessingError::InvalidConfig(format!("HTTP client build failed: {e}")))
}

fn with_auth(request: reqwest::RequestBuilder, api_key: &Option<String>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Transcription service client
pub struct HttpTranscriptionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTranscriptionProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.transcription_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl TranscriptionProvider for HttpTranscriptionProvider {
    async fn transcribe(
        &self,
        media: &[u8],
        source_id: &str,
        kind: SourceKind,
        options: &TranscribeOptions,
    ) -> Result<Transcript> {
        let kind = match kind {
            SourceKind::Audio => "audio",
            SourceKind::Video => "video",
        };
        let mut query: Vec<(&str, String)> = vec![
            ("source_id", source_id.to_string()),
            ("kind", kind.to_string()),
            ("diarize", options.diarize.to_string()),
        ];
        if let Some(language) = &options.language {
            query.push(("language", language.clone()));
        }

        let request = self
            .client
            .post(format!("{}/v1/transcriptions", self.base_url))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(media.to_vec());

        let response = with_auth(request, &self.api_key)
            .send()
            .await
            .map_err(|e| ProcessingError::TranscriptionError(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessingError::TranscriptionError(format!(
                "service returned {status}: {body}"
            )));
        }

        response
            .json::<Transcript>()
            .await
            .map_err(|e| ProcessingError::TranscriptionError(format!("bad response body: {e}")))
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [EmbeddingInput],
}

#[derive(Deserialize)]
struct EmbedResponse {
    records: Vec<EmbeddedRecord>,
}

/// Embedding service client
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.embedding_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, inputs: &[EmbeddingInput]) -> Result<Vec<EmbeddedRecord>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&EmbedRequest { inputs });

        let response = with_auth(request, &self.api_key)
            .send()
            .await
            .map_err(|e| ProcessingError::EmbeddingError(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessingError::EmbeddingError(format!(
                "service returned {status}: {body}"
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProcessingError::EmbeddingError(format!("bad response body: {e}")))?;

        if body.records.len() != inputs.len() {
            return Err(ProcessingError::EmbeddingError(format!(
                "expected {} records, got {}",
                inputs.len(),
                body.records.len()
            )));
        }
        Ok(body.records)
    }
}
