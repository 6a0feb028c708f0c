//! Vector storage implementation using Qdrant
//!
//! Embedded text chunks are upserted here. Upserts are idempotent by
//! record id: the point id is a stable hash of the record id, so the same
//! chunk written twice overwrites instead of duplicating. That property is
//! the downstream backstop for the engine's at-least-once semantics.

use crate::{StorageError, StorageResult};
use media_ingest_common::{EmbeddedRecord, Metadata};
use qdrant_client::{
    qdrant::{
        vectors_config::Config, Condition, CreateCollectionBuilder, Distance, Filter, PointStruct,
        SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParams, VectorsConfig,
    },
    Qdrant,
};
use serde::{Deserialize, Serialize};

/// Qdrant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    /// Qdrant URL (e.g. "<http://localhost:6334>")
    pub url: String,

    /// API key (optional, for cloud deployment)
    pub api_key: Option<String>,

    /// Collection name
    pub collection: String,

    /// Embedding dimension
    pub vector_dim: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("QDRANT_URL")
                .unwrap_or_else(|_| "http://localhost:6334".to_string()),
            api_key: std::env::var("QDRANT_API_KEY").ok(),
            collection: "media_chunks".to_string(),
            vector_dim: 1536,
        }
    }
}

/// One similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Record id of the stored chunk
    pub id: String,
    /// Similarity score (higher is more similar)
    pub score: f32,
    /// Stored metadata, including ownership fields
    pub metadata: Metadata,
}

/// Vector store interface
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert a batch of embedded records, idempotently by record id
    async fn upsert_many(&self, records: &[EmbeddedRecord]) -> StorageResult<()>;

    /// Similarity search, optionally filtered on metadata equality
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<Metadata>,
    ) -> StorageResult<Vec<SearchHit>>;
}

/// Qdrant vector store implementation
pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    vector_dim: u64,
}

impl QdrantVectorStore {
    /// Create a client and ensure the collection exists
    pub async fn new(config: QdrantConfig) -> StorageResult<Self> {
        let client = if let Some(api_key) = &config.api_key {
            Qdrant::from_url(&config.url)
                .api_key(api_key.clone())
                .build()
                .map_err(|e| StorageError::QdrantError(e.to_string()))?
        } else {
            Qdrant::from_url(&config.url)
                .build()
                .map_err(|e| StorageError::QdrantError(e.to_string()))?
        };

        let store = Self {
            client,
            collection: config.collection,
            vector_dim: config.vector_dim,
        };
        store.init_collection().await?;
        Ok(store)
    }

    async fn init_collection(&self) -> StorageResult<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(VectorsConfig {
                        config: Some(Config::Params(VectorParams {
                            size: self.vector_dim,
                            distance: Distance::Cosine.into(),
                            ..Default::default()
                        })),
                    }),
                )
                .await
                .map_err(|e| StorageError::QdrantError(e.to_string()))?;

            tracing::info!("Created Qdrant collection: {}", self.collection);
        }

        Ok(())
    }

    /// Stable point id for a record id: same record id, same point, so
    /// repeated upserts overwrite
    fn point_id(record_id: &str) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        record_id.hash(&mut hasher);
        hasher.finish()
    }
}

#[async_trait::async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert_many(&self, records: &[EmbeddedRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(records.len());
        points.extend(records.iter().map(|record| {
            // The value type is spelled out so inference never depends on
            // which `From<HashMap<..>>` impls the resolved client carries.
            let mut payload: std::collections::HashMap<String, Value> =
                std::collections::HashMap::with_capacity(1 + record.metadata.len());
            payload.insert("record_id".to_string(), record.id.clone().into());
            for (k, v) in &record.metadata {
                payload.insert(k.clone(), v.clone().into());
            }
            PointStruct::new(Self::point_id(&record.id), record.embedding.clone(), payload)
        }));

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<Metadata>,
    ) -> StorageResult<Vec<SearchHit>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection, query.to_vec(), top_k as u64)
                .with_payload(true);

        if let Some(filter_map) = filter {
            let mut conditions = Vec::with_capacity(filter_map.len());
            conditions.extend(
                filter_map
                    .iter()
                    .map(|(key, value)| Condition::matches(key.clone(), value.clone())),
            );
            builder = builder.filter(Filter {
                must: conditions,
                ..Default::default()
            });
        }

        let result = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        let mut hits = Vec::with_capacity(result.result.len());
        hits.extend(result.result.into_iter().map(|scored| {
            let mut metadata = Metadata::with_capacity(scored.payload.len());
            for (key, value) in scored.payload {
                if let Some(qdrant_client::qdrant::value::Kind::StringValue(s)) = value.kind {
                    metadata.insert(key, s);
                }
            }
            let id = metadata.remove("record_id").unwrap_or_default();
            SearchHit {
                id,
                score: scored.score,
                metadata,
            }
        }));

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qdrant_config_default() {
        let config = QdrantConfig::default();
        assert_eq!(config.collection, "media_chunks");
        assert_eq!(config.vector_dim, 1536);
    }

    #[test]
    fn test_point_id_is_stable() {
        let a = QdrantVectorStore::point_id("chunk-abc");
        let b = QdrantVectorStore::point_id("chunk-abc");
        let c = QdrantVectorStore::point_id("chunk-def");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
