//! In-memory collaborators for dispatcher and watcher tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use tryon_jobs::models::job::{Job, JobFlags, JobStatus, NewJob};
use tryon_jobs::services::assets::{
    AssetError, AssetFetcher, AssetResolver, AssetRole, EncodedImage, ResolvedAsset,
    UserPreferences,
};
use tryon_jobs::services::dispatcher::{Dispatcher, DispatcherDeps};
use tryon_jobs::services::lifecycle::JobPatch;
use tryon_jobs::services::providers::{GenerationBackend, ProviderError, ProviderRegistry};
use tryon_jobs::services::storage::{owner_scoped_path, AssetWriter, StorageError, StoredAsset};
use tryon_jobs::services::store::{
    JobStore, JobSubscription, MemoryJobStore, StoreError, UpdateOutcome,
};
use tryon_jobs::services::watcher::{WatchFailure, WatchObserver};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const PUBLIC_BASE: &str = "https://cdn.test";

/// Minimal PNG signature, enough for format sniffing.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
        .map(|t| t.with_timezone(&Utc))
        .unwrap()
}

pub fn submission(style: &str) -> NewJob {
    NewJob {
        user_id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        model_id: Uuid::new_v4(),
        style: style.to_string(),
        user_instructions: Some("Tuck the shirt in".to_string()),
        ai_model: None,
    }
}

// ---------------------------------------------------------------------------
// Store wrapper
// ---------------------------------------------------------------------------

/// Wraps a [`MemoryJobStore`], counting reads and optionally hiding the
/// change feed.
pub struct CountingStore {
    pub inner: MemoryJobStore,
    pub gets: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub push_enabled: bool,
}

impl CountingStore {
    pub fn new(push_enabled: bool) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            gets: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            push_enabled,
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for CountingStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(job_id).await
    }

    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<UpdateOutcome, StoreError> {
        self.inner.update(job_id, patch).await
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<Option<JobSubscription>, StoreError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.push_enabled {
            self.inner.subscribe(job_id).await
        } else {
            Ok(None)
        }
    }

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        self.inner.create(new_job).await
    }

    async fn list_by_owner(&self, user_id: Uuid, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.inner.list_by_owner(user_id, limit).await
    }

    async fn set_flags(&self, job_id: Uuid, flags: JobFlags) -> Result<Option<Job>, StoreError> {
        self.inner.set_flags(job_id, flags).await
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.inner.find_stale(older_than).await
    }
}

// ---------------------------------------------------------------------------
// Asset collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeResolver {
    pub calls: AtomicUsize,
    pub missing: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl AssetResolver for FakeResolver {
    async fn resolve(&self, asset_id: Uuid) -> Result<ResolvedAsset, AssetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing.lock().unwrap().contains(&asset_id) {
            return Err(AssetError::NotFound(asset_id));
        }
        Ok(ResolvedAsset {
            retrieval_url: format!("https://assets.test/{asset_id}"),
            content_type: "image/jpeg".to_string(),
        })
    }
}

/// Behavior of [`FakeFetcher`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Ok,
    Timeout,
    NotFoundStatus,
}

pub struct FakeFetcher {
    pub calls: AtomicUsize,
    pub mode: FetchMode,
}

impl FakeFetcher {
    pub fn new(mode: FetchMode) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode,
        }
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(&self, role: AssetRole, asset: &ResolvedAsset) -> Result<EncodedImage, AssetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FetchMode::Ok => Ok(EncodedImage::from_bytes(&asset.content_type, b"jpeg-bytes")),
            FetchMode::Timeout => Err(AssetError::Timeout { role, secs: 30 }),
            FetchMode::NotFoundStatus => Err(AssetError::Status { role, status: 404 }),
        }
    }
}

/// Object store that refuses overwrites.
#[derive(Default)]
pub struct FakeWriter {
    pub calls: AtomicUsize,
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeWriter {
    pub fn seed(&self, path: &str, bytes: &[u8]) {
        self.objects.lock().unwrap().insert(path.to_string(), bytes.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl AssetWriter for FakeWriter {
    async fn store(
        &self,
        owner_id: &str,
        path_hint: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredAsset, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = owner_scoped_path(owner_id, path_hint);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&path) {
            return Err(StorageError::Collision(path));
        }
        objects.insert(path.clone(), bytes.to_vec());
        Ok(StoredAsset { path })
    }

    fn public_url(&self, path: &str) -> String {
        format!("{PUBLIC_BASE}/{path}")
    }
}

pub struct FakePreferences {
    pub model: Option<String>,
}

#[async_trait]
impl UserPreferences for FakePreferences {
    async fn preferred_model(&self, _user_id: Uuid) -> Result<Option<String>, AssetError> {
        Ok(self.model.clone())
    }
}

// ---------------------------------------------------------------------------
// Generation backend
// ---------------------------------------------------------------------------

pub struct ScriptedBackend {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub models: Mutex<Vec<String>>,
    pub output: Option<EncodedImage>,
    pub delay: Duration,
}

impl ScriptedBackend {
    pub fn returning_png() -> Self {
        Self::with_output(Some(EncodedImage::from_bytes("image/png", PNG_BYTES)))
    }

    pub fn returning_nothing() -> Self {
        Self::with_output(None)
    }

    pub fn with_output(output: Option<EncodedImage>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
            output,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate_image(
        &self,
        _subject: &EncodedImage,
        _garment: &EncodedImage,
        prompt: &str,
        model: &str,
    ) -> Result<EncodedImage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.models.lock().unwrap().push(model.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.output.clone().ok_or(ProviderError::EmptyResult)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub resolver: Arc<FakeResolver>,
    pub fetcher: Arc<FakeFetcher>,
    pub writer: Arc<FakeWriter>,
    pub backend: Arc<ScriptedBackend>,
    pub dispatcher: Dispatcher,
}

pub struct HarnessBuilder {
    fetch_mode: FetchMode,
    backend: ScriptedBackend,
    preferred_model: Option<String>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            fetch_mode: FetchMode::Ok,
            backend: ScriptedBackend::returning_png(),
            preferred_model: None,
        }
    }

    pub fn fetch_mode(mut self, mode: FetchMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    pub fn backend(mut self, backend: ScriptedBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn preferred_model(mut self, model: &str) -> Self {
        self.preferred_model = Some(model.to_string());
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let resolver = Arc::new(FakeResolver::default());
        let fetcher = Arc::new(FakeFetcher::new(self.fetch_mode));
        let writer = Arc::new(FakeWriter::default());
        let backend = Arc::new(self.backend);

        let dispatcher = Dispatcher::new(DispatcherDeps {
            store: store.clone(),
            resolver: resolver.clone(),
            fetcher: fetcher.clone(),
            writer: writer.clone(),
            preferences: Arc::new(FakePreferences {
                model: self.preferred_model,
            }),
            providers: ProviderRegistry::new(backend.clone(), DEFAULT_MODEL),
        })
        .with_clock(fixed_now);

        Harness {
            store,
            resolver,
            fetcher,
            writer,
            backend,
            dispatcher,
        }
    }
}

impl Harness {
    pub async fn seed(&self, style: &str) -> Job {
        self.store.create(submission(style)).await.unwrap()
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.store.get(job_id).await.unwrap().unwrap()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.writer.calls.load(Ordering::SeqCst)
    }

    pub fn backend_calls(&self) -> usize {
        self.backend.calls.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Watcher observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Transition { from: JobStatus, to: JobStatus },
    Completed(Job),
    Failed(WatchFailure),
}

/// Forwards every callback onto a channel.
pub struct RecordingObserver {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl RecordingObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl WatchObserver for RecordingObserver {
    fn on_transition(&self, job: &Job, previous: JobStatus) {
        let _ = self.tx.send(WatchEvent::Transition {
            from: previous,
            to: job.status,
        });
    }

    fn on_completed(&self, job: &Job) {
        let _ = self.tx.send(WatchEvent::Completed(job.clone()));
    }

    fn on_failed(&self, failure: &WatchFailure) {
        let _ = self.tx.send(WatchEvent::Failed(failure.clone()));
    }
}

/// Receive the next event or panic after `within`.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, within: Duration) -> WatchEvent {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("timed out waiting for watcher event")
        .expect("observer channel closed")
}

/// Drain whatever arrives within `window`.
pub async fn drain(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, window: Duration) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        events.push(event);
    }
    events
}
