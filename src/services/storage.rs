use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

/// Where a stored result landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub path: String,
}

/// Output asset store. Implementations must refuse to overwrite an
/// existing path.
#[async_trait]
pub trait AssetWriter: Send + Sync {
    async fn store(
        &self,
        owner_id: &str,
        path_hint: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredAsset, StorageError>;

    fn public_url(&self, path: &str) -> String;
}

/// Object key for a user's stored result.
pub fn owner_scoped_path(owner_id: &str, path_hint: &str) -> String {
    format!("results/{}/{}", owner_id, path_hint.trim_start_matches('/'))
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Whether an object already exists at `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, code)) => Ok((200..300).contains(&code)),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(StorageError::S3(e)),
        }
    }

    /// Upload bytes to R2.
    pub async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        let code = response.status_code();
        if !(200..300).contains(&code) {
            return Err(StorageError::Rejected { key: key.to_string(), code });
        }
        Ok(())
    }

    /// Time-limited GET URL for a private object.
    pub async fn presigned_url(&self, key: &str, ttl_secs: u32) -> Result<String, StorageError> {
        Ok(self.bucket.presign_get(key, ttl_secs, None).await?)
    }

    /// Check bucket reachability (for health checks).
    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.bucket.list("results/".to_string(), Some("/".to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl AssetWriter for R2Client {
    async fn store(
        &self,
        owner_id: &str,
        path_hint: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredAsset, StorageError> {
        let path = owner_scoped_path(owner_id, path_hint);
        // R2 has no create-only put here; the time-based suffix keeps the
        // head-then-put window collision free in practice.
        if self.exists(&path).await? {
            return Err(StorageError::Collision(path));
        }
        self.upload(&path, bytes, content_type).await?;
        Ok(StoredAsset { path })
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("A result already exists at \"{0}\"; refusing to overwrite it")]
    Collision(String),

    #[error("Storage rejected upload of \"{key}\" with HTTP {code}")]
    Rejected { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
