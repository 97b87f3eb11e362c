//! Input asset access: resolving asset ids to retrieval URLs, fetching the
//! bytes, and the user preference lookup the dispatcher needs.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::services::storage::R2Client;

/// Image bytes in transport form (base64 plus MIME type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.data.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }
}

/// Where to download an asset and what it claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub retrieval_url: String,
    pub content_type: String,
}

/// Which input an asset plays in a job (for error messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AssetRole {
    Model,
    Garment,
}

#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn resolve(&self, asset_id: Uuid) -> Result<ResolvedAsset, AssetError>;
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download and fully buffer one asset.
    async fn fetch(&self, role: AssetRole, asset: &ResolvedAsset) -> Result<EncodedImage, AssetError>;
}

#[async_trait]
pub trait UserPreferences: Send + Sync {
    async fn preferred_model(&self, user_id: Uuid) -> Result<Option<String>, AssetError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset {0} not found")]
    NotFound(Uuid),

    #[error("Timed out after {secs}s downloading the {role} image")]
    Timeout { role: AssetRole, secs: u64 },

    #[error("Downloading the {role} image failed with HTTP {status}")]
    Status { role: AssetRole, status: u16 },

    #[error("Downloading the {role} image failed: {source}")]
    Http {
        role: AssetRole,
        #[source]
        source: reqwest::Error,
    },

    #[error("The {role} image is empty")]
    Empty { role: AssetRole },

    #[error("Could not issue a download URL: {0}")]
    Url(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Resolves asset ids through the `assets` table to presigned R2 URLs.
pub struct PgAssetResolver {
    pool: PgPool,
    storage: Arc<R2Client>,
    url_ttl_secs: u32,
}

impl PgAssetResolver {
    pub fn new(pool: PgPool, storage: Arc<R2Client>, url_ttl_secs: u32) -> Self {
        Self {
            pool,
            storage,
            url_ttl_secs,
        }
    }
}

#[async_trait]
impl AssetResolver for PgAssetResolver {
    async fn resolve(&self, asset_id: Uuid) -> Result<ResolvedAsset, AssetError> {
        let (storage_key, content_type) = queries::get_asset(&self.pool, asset_id)
            .await?
            .ok_or(AssetError::NotFound(asset_id))?;

        let retrieval_url = self
            .storage
            .presigned_url(&storage_key, self.url_ttl_secs)
            .await
            .map_err(|e| AssetError::Url(e.to_string()))?;

        Ok(ResolvedAsset {
            retrieval_url,
            content_type,
        })
    }
}

/// Plain HTTP GET with a bounded per-request timeout.
pub struct HttpAssetFetcher {
    http: Client,
    timeout: Duration,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, role: AssetRole, asset: &ResolvedAsset) -> Result<EncodedImage, AssetError> {
        let to_error = |source: reqwest::Error| {
            if source.is_timeout() {
                AssetError::Timeout {
                    role,
                    secs: self.timeout.as_secs(),
                }
            } else {
                AssetError::Http { role, source }
            }
        };

        let response = self
            .http
            .get(&asset.retrieval_url)
            .send()
            .await
            .map_err(to_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::Status {
                role,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(to_error)?;
        if bytes.is_empty() {
            return Err(AssetError::Empty { role });
        }

        Ok(EncodedImage::from_bytes(&asset.content_type, &bytes))
    }
}

pub struct PgUserPreferences {
    pool: PgPool,
}

impl PgUserPreferences {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserPreferences for PgUserPreferences {
    async fn preferred_model(&self, user_id: Uuid) -> Result<Option<String>, AssetError> {
        let model = queries::get_preferred_model(&self.pool, user_id).await?;
        Ok(model.filter(|m| !m.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_image_round_trips_bytes() {
        let image = EncodedImage::from_bytes("image/jpeg", &[0xff, 0xd8, 0xff]);
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.decode().unwrap(), vec![0xff, 0xd8, 0xff]);
    }

    #[test]
    fn timeout_message_names_the_role() {
        let err = AssetError::Timeout {
            role: AssetRole::Garment,
            secs: 30,
        };
        assert_eq!(err.to_string(), "Timed out after 30s downloading the garment image");
    }
}
