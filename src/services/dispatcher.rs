//! Transformation dispatcher: runs one try-on job end to end.
//!
//! The `queued/pending -> processing` write is the commit point. A second
//! invocation that finds the job already claimed or finished returns
//! [`DispatchOutcome::Skipped`] before any external call. Every error after
//! the claim is turned into exactly one `failed` write.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::services::assets::{
    AssetError, AssetFetcher, AssetResolver, AssetRole, EncodedImage, UserPreferences,
};
use crate::services::lifecycle::{JobPatch, PolicyViolation};
use crate::services::prompt::{self, PIPELINE_VERSION, PROMPT_VERSION};
use crate::services::providers::{ProviderError, ProviderRegistry};
use crate::services::storage::{AssetWriter, StorageError};
use crate::services::store::{JobStore, StoreError, UpdateOutcome};

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(Job),
    Failed(Job),
    /// The job was already claimed or terminal; nothing was done.
    Skipped { status: JobStatus },
}

/// Collaborators the dispatcher needs, owned by whoever wires the process.
#[derive(Clone)]
pub struct DispatcherDeps {
    pub store: Arc<dyn JobStore>,
    pub resolver: Arc<dyn AssetResolver>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub writer: Arc<dyn AssetWriter>,
    pub preferences: Arc<dyn UserPreferences>,
    pub providers: ProviderRegistry,
}

pub struct Dispatcher {
    deps: DispatcherDeps,
    clock: fn() -> DateTime<Utc>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        Self {
            deps,
            clock: Utc::now,
        }
    }

    /// Replace the time source (result naming and timestamps).
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Execute one job attempt. `Err` is only returned when no job update
    /// could be made (job missing, or the store itself is unavailable).
    pub async fn process_job(
        &self,
        job_id: Uuid,
        model_override: Option<&str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let job = self
            .deps
            .store
            .get(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))?;

        if !matches!(job.status, JobStatus::Queued | JobStatus::Pending) {
            return Ok(self.skipped(job_id, job.status));
        }

        let started_at = (self.clock)();
        let claimed = match self
            .deps
            .store
            .update(job_id, JobPatch::start(started_at, PROMPT_VERSION, PIPELINE_VERSION))
            .await?
        {
            UpdateOutcome::Applied(job) => job,
            UpdateOutcome::Rejected { current } => return Ok(self.skipped(job_id, current)),
        };

        tracing::info!(
            job_id = %job_id,
            user_id = %claimed.user_id,
            style = %claimed.style,
            "Processing try-on job"
        );
        metrics::counter!("tryon_jobs_dispatched_total").increment(1);
        let timer = Instant::now();

        let mut attempted_model = None;
        let result = self.run(&claimed, model_override, &mut attempted_model).await;
        metrics::histogram!("tryon_job_processing_seconds").record(timer.elapsed().as_secs_f64());

        match result {
            Ok(job) => {
                metrics::counter!("tryon_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %job_id,
                    model = job.ai_model_used.as_deref().unwrap_or_default(),
                    duration_ms = timer.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                Ok(DispatchOutcome::Completed(job))
            }
            Err(err) => self.record_failure(job_id, err, attempted_model).await,
        }
    }

    fn skipped(&self, job_id: Uuid, status: JobStatus) -> DispatchOutcome {
        metrics::counter!("tryon_jobs_skipped_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            status = %status,
            "Job already claimed or finished, skipping duplicate dispatch"
        );
        DispatchOutcome::Skipped { status }
    }

    async fn run(
        &self,
        job: &Job,
        model_override: Option<&str>,
        attempted_model: &mut Option<String>,
    ) -> Result<Job, DispatchError> {
        // Model resolution: override, then user preference, then default.
        let selector = match model_override.map(str::trim).filter(|m| !m.is_empty()) {
            Some(model) => model.to_string(),
            None => self.preferred_model(job.user_id).await,
        };
        let provider = self.deps.providers.resolve(&selector);
        *attempted_model = Some(provider.model.clone());

        tracing::debug!(
            job_id = %job.id,
            selector = %selector,
            provider = %provider.descriptor.display_name,
            can_generate = provider.descriptor.can_generate_images,
            "Resolved provider"
        );
        if !provider.descriptor.can_generate_images {
            return Err(provider.capability_error().into());
        }

        let (subject, garment) = tokio::try_join!(
            self.materialize(job.model_id, AssetRole::Model),
            self.materialize(job.product_id, AssetRole::Garment),
        )?;

        let instructions = prompt::build_instructions(&job.style, job.user_instructions.as_deref());

        tracing::debug!(job_id = %job.id, model = %provider.model, "Calling generation backend");
        let generated = provider.generate_image(&subject, &garment, &instructions).await?;
        let bytes = generated.decode().map_err(|_| DispatchError::UndecodableResult)?;
        if bytes.is_empty() {
            return Err(ProviderError::EmptyResult.into());
        }

        let (content_type, extension) = detect_format(&bytes, &generated.mime_type);
        let path_hint = format!("{}-{}.{}", job.id, (self.clock)().timestamp_millis(), extension);
        let stored = self
            .deps
            .writer
            .store(&job.user_id.to_string(), &path_hint, &bytes, &content_type)
            .await?;
        let result_url = self.deps.writer.public_url(&stored.path);

        tracing::debug!(job_id = %job.id, path = %stored.path, bytes = bytes.len(), "Stored result");

        let patch = JobPatch::complete((self.clock)(), result_url, provider.model.clone());
        match self.deps.store.update(job.id, patch).await? {
            UpdateOutcome::Applied(job) => Ok(job),
            UpdateOutcome::Rejected { current } => Err(PolicyViolation {
                from: current,
                to: JobStatus::Completed,
            }
            .into()),
        }
    }

    async fn preferred_model(&self, user_id: Uuid) -> String {
        match self.deps.preferences.preferred_model(user_id).await {
            Ok(Some(model)) => model,
            Ok(None) => self.deps.providers.default_model().to_string(),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Preference lookup failed, using default model");
                self.deps.providers.default_model().to_string()
            }
        }
    }

    async fn materialize(&self, asset_id: Uuid, role: AssetRole) -> Result<EncodedImage, DispatchError> {
        let resolved = self.deps.resolver.resolve(asset_id).await?;
        Ok(self.deps.fetcher.fetch(role, &resolved).await?)
    }

    /// The single outer failure boundary: one `failed` write per attempt.
    async fn record_failure(
        &self,
        job_id: Uuid,
        err: DispatchError,
        attempted_model: Option<String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        metrics::counter!("tryon_jobs_failed_total", "reason" => err.reason()).increment(1);
        tracing::error!(job_id = %job_id, reason = err.reason(), error = %err, "Job processing failed");

        let mut patch = JobPatch::fail((self.clock)(), err.to_string());
        if let Some(model) = attempted_model {
            patch = patch.with_model(model);
        }

        match self.deps.store.update(job_id, patch).await {
            Ok(UpdateOutcome::Applied(job)) => Ok(DispatchOutcome::Failed(job)),
            Ok(UpdateOutcome::Rejected { current }) => {
                metrics::counter!("tryon_policy_violations_total").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    current = %current,
                    "Policy violation: could not record failure, job is no longer running"
                );
                Err(err)
            }
            Err(store_err) => {
                tracing::error!(job_id = %job_id, error = %store_err, "Failed to record job failure");
                Err(err)
            }
        }
    }
}

/// Content type and file extension of generated bytes. Unsniffable bytes
/// take the backend-reported type when it is one we store, else PNG.
fn detect_format(bytes: &[u8], reported_mime: &str) -> (String, &'static str) {
    if let Ok(format) = image::guess_format(bytes) {
        let extension = format.extensions_str().first().copied().unwrap_or("img");
        return (format.to_mime_type().to_string(), extension);
    }
    let (mime, extension) = match reported_mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => ("image/jpeg", "jpg"),
        "image/webp" => ("image/webp", "webp"),
        _ => ("image/png", "png"),
    };
    (mime.to_string(), extension)
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("The AI model returned an image that could not be decoded")]
    UndecodableResult,

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Low-cardinality label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Provider(ProviderError::Capability { .. }) => "capability",
            DispatchError::Provider(ProviderError::EmptyResult) | DispatchError::UndecodableResult => {
                "empty_result"
            }
            DispatchError::Provider(_) => "backend",
            DispatchError::Asset(AssetError::NotFound(_)) => "asset_not_found",
            DispatchError::Asset(AssetError::Timeout { .. }) => "timeout",
            DispatchError::Asset(_) => "transport",
            DispatchError::Storage(StorageError::Collision(_)) => "collision",
            DispatchError::Storage(_) => "storage",
            DispatchError::Policy(_) => "policy",
            DispatchError::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_png_from_magic_bytes() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
        assert_eq!(detect_format(&png, "application/octet-stream"), ("image/png".to_string(), "png"));
    }

    #[test]
    fn falls_back_to_reported_mime() {
        assert_eq!(detect_format(b"not an image", "image/webp"), ("image/webp".to_string(), "webp"));
    }

    #[test]
    fn non_image_mime_is_stored_as_png() {
        assert_eq!(
            detect_format(b"not an image", "application/octet-stream"),
            ("image/png".to_string(), "png")
        );
        assert_eq!(detect_format(b"not an image", "image/gif"), ("image/png".to_string(), "png"));
    }

    #[test]
    fn capability_reason_is_distinct() {
        let err: DispatchError = ProviderError::EmptyResult.into();
        assert_eq!(err.reason(), "empty_result");
        let err: DispatchError = StorageError::Collision("p".into()).into();
        assert_eq!(err.reason(), "collision");
    }
}
