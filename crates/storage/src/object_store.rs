//! Object storage implementation using S3/MinIO
//!
//! Raw uploads and extracted media parts live here; the job engine reads
//! sources for transcription and writes part files during chunking.

use crate::{StorageError, StorageResult};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region, or "us-east-1" for `MinIO`
    pub region: String,

    /// Custom endpoint for `MinIO`, empty for AWS S3
    pub endpoint: Option<String>,

    /// AWS access key ID
    pub access_key_id: String,

    /// AWS secret access key
    pub secret_access_key: String,

    /// Path prefix for all objects
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "media-ingest".to_string()),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-west-2".to_string()),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

impl S3Config {
    /// Fail fast on missing credentials instead of erroring on the first
    /// request mid-job
    pub fn validate(&self) -> StorageResult<()> {
        if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "Missing S3 credentials (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Object storage interface
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes under `key`, returning the full key written
    async fn write(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> StorageResult<String>;

    /// Retrieve the bytes stored under `key`
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Whether an object exists under `key`
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete the object under `key`
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Object size in bytes
    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// List keys under a prefix
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// S3/MinIO object storage implementation
pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStorage {
    /// Create a new S3 object storage client
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        config.validate()?;

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "media-ingest-storage",
        );

        let region = Region::new(config.region.clone());

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(region)
            .behavior_version_latest();

        // MinIO requires path-style addressing
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn write(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data.to_vec()));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(full_key)
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let full_key = self.full_key(key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::NotFound(full_key.clone())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let full_key = self.full_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().contains("NotFound") {
                    Ok(false)
                } else {
                    Err(StorageError::S3Error(e.to_string()))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(())
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        let full_key = self.full_key(key);

        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NotFound") {
                    StorageError::NotFound(full_key.clone())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        Ok(response.content_length().unwrap_or(0) as u64)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(std::string::ToString::to_string))
            .collect();

        Ok(keys)
    }
}
