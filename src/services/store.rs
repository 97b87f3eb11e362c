//! Job Store: the single source of truth for job state.
//!
//! Updates are compare-and-transition: a [`JobPatch`] is only applied when
//! the job's current status is one of the lifecycle's allowed sources for
//! the patch's target status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{Job, JobFlags, JobStatus, NewJob};
use crate::services::lifecycle::JobPatch;

/// Buffer for per-job change events handed to a subscriber.
const SUBSCRIPTION_BUFFER: usize = 32;

/// Capacity of the change feeds. A subscriber that falls further behind
/// loses its subscription and has to poll.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Postgres channel every job change is announced on. Payload is the job id.
pub const CHANGE_CHANNEL: &str = "tryon_job_changes";

/// Pause before the shared listener retries after a connection error.
const LISTENER_RETRY: Duration = Duration::from_secs(1);

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The transition was legal and has been persisted.
    Applied(Job),
    /// The job was in a status the transition cannot leave from. Nothing
    /// was written.
    Rejected { current: JobStatus },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Apply `patch` if the job's current status allows it.
    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<UpdateOutcome, StoreError>;

    /// Open a change subscription scoped to one job. `None` means the store
    /// has no change notifications and callers must poll.
    async fn subscribe(&self, job_id: Uuid) -> Result<Option<JobSubscription>, StoreError>;

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Jobs owned by `user_id`, newest first.
    async fn list_by_owner(&self, user_id: Uuid, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Update the UI-only flags. Allowed in any status.
    async fn set_flags(&self, job_id: Uuid, flags: JobFlags) -> Result<Option<Job>, StoreError>;

    /// Non-terminal jobs created before `older_than`.
    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
}

/// A stream of job snapshots for one job id. Dropping it tears down the
/// underlying listener.
pub struct JobSubscription {
    rx: mpsc::Receiver<Job>,
    forwarder: JoinHandle<()>,
}

impl JobSubscription {
    fn new(rx: mpsc::Receiver<Job>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Next change event. `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<Job> {
        self.rx.recv().await
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Mutex-guarded map with a broadcast change feed.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    changes: broadcast::Sender<Job>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job record as-is.
    pub fn insert(&self, job: Job) {
        self.lock().insert(job.id, job.clone());
        let _ = self.changes.send(job);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<UpdateOutcome, StoreError> {
        let updated = {
            let mut jobs = self.lock();
            let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
            if patch.apply_to(job).is_err() {
                return Ok(UpdateOutcome::Rejected {
                    current: job.status,
                });
            }
            job.clone()
        };
        let _ = self.changes.send(updated.clone());
        Ok(UpdateOutcome::Applied(updated))
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<Option<JobSubscription>, StoreError> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(job) if job.id == job_id => {
                        if tx.send(job).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        // Closing hands the watcher back to polling.
                        tracing::warn!(job_id = %job_id, skipped, "Change feed lagged, closing subscription");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(Some(JobSubscription::new(rx, forwarder)))
    }

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let job = Job::from_submission(new_job);
        self.insert(job.clone());
        Ok(job)
    }

    async fn list_by_owner(&self, user_id: Uuid, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| job.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn set_flags(&self, job_id: Uuid, flags: JobFlags) -> Result<Option<Job>, StoreError> {
        let updated = {
            let mut jobs = self.lock();
            let Some(job) = jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if let Some(favorite) = flags.is_favorite {
                job.is_favorite = favorite;
            }
            if let Some(public) = flags.is_public {
                job.is_public = public;
            }
            job.clone()
        };
        let _ = self.changes.send(updated.clone());
        Ok(Some(updated))
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|job| !job.status.is_terminal() && job.created_at < older_than)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL store
// ---------------------------------------------------------------------------

/// What the shared Postgres listener fans out to subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// The row with this id changed.
    Changed(Uuid),
    /// The listener lost its connection; notifications may have been missed.
    Interrupted,
}

/// Postgres-backed store. Push subscriptions ride on `LISTEN/NOTIFY`: a
/// trigger notifies [`CHANGE_CHANNEL`] on every row change, and a single
/// listener per store fans the job ids out to all subscriptions. The
/// listener holds one pooled connection no matter how many jobs are watched.
pub struct PgJobStore {
    pool: PgPool,
    feed: OnceCell<broadcast::Sender<FeedEvent>>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            feed: OnceCell::new(),
        }
    }

    /// Start the shared listener on first use.
    async fn feed(&self) -> Result<&broadcast::Sender<FeedEvent>, StoreError> {
        let pool = &self.pool;
        self.feed
            .get_or_try_init(|| async move {
                let mut listener = PgListener::connect_with(pool).await?;
                listener.listen(CHANGE_CHANNEL).await?;
                let (tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
                tokio::spawn(run_listener(listener, tx.clone()));
                tracing::info!(channel = CHANGE_CHANNEL, "Job change listener started");
                Ok::<_, StoreError>(tx)
            })
            .await
    }
}

async fn run_listener(mut listener: PgListener, tx: broadcast::Sender<FeedEvent>) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => match Uuid::parse_str(notification.payload()) {
                Ok(job_id) => {
                    let _ = tx.send(FeedEvent::Changed(job_id));
                }
                Err(_) => {
                    tracing::warn!(payload = notification.payload(), "Ignoring malformed job change payload");
                }
            },
            Ok(None) => {
                // The next try_recv reconnects and re-listens.
                tracing::warn!("Job change listener lost its connection");
                let _ = tx.send(FeedEvent::Interrupted);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Job change listener failed, retrying");
                let _ = tx.send(FeedEvent::Interrupted);
                tokio::time::sleep(LISTENER_RETRY).await;
            }
        }
    }
}

/// Forward changes of one job from the shared feed, re-reading the row so
/// push events decode exactly like direct reads. Any gap (lag, listener
/// interruption, failed reload) closes the subscription.
fn forward_job_changes<F, Fut>(
    mut feed: broadcast::Receiver<FeedEvent>,
    job_id: Uuid,
    reload: F,
) -> JobSubscription
where
    F: Fn(Uuid) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Job>, sqlx::Error>> + Send,
{
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let forwarder = tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(FeedEvent::Changed(id)) if id == job_id => {}
                Ok(FeedEvent::Changed(_)) => continue,
                Ok(FeedEvent::Interrupted) => {
                    tracing::warn!(job_id = %job_id, "Change feed interrupted, closing subscription");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %job_id, skipped, "Change feed lagged, closing subscription");
                    break;
                }
                Err(RecvError::Closed) => break,
            }

            match reload(job_id).await {
                Ok(Some(job)) => {
                    if tx.send(job).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to reload notified job, closing subscription");
                    break;
                }
            }
        }
    });
    JobSubscription::new(rx, forwarder)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<UpdateOutcome, StoreError> {
        if let Some(job) = queries::apply_patch(&self.pool, job_id, &patch).await? {
            return Ok(UpdateOutcome::Applied(job));
        }
        match queries::get_job_status(&self.pool, job_id).await? {
            Some(current) => Ok(UpdateOutcome::Rejected { current }),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<Option<JobSubscription>, StoreError> {
        let feed = self.feed().await?.subscribe();
        let pool = self.pool.clone();
        Ok(Some(forward_job_changes(feed, job_id, move |id| {
            let pool = pool.clone();
            async move { queries::get_job(&pool, id).await }
        })))
    }

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        Ok(queries::create_job(&self.pool, &new_job).await?)
    }

    async fn list_by_owner(&self, user_id: Uuid, limit: i64) -> Result<Vec<Job>, StoreError> {
        Ok(queries::list_jobs_for_user(&self.pool, user_id, limit).await?)
    }

    async fn set_flags(&self, job_id: Uuid, flags: JobFlags) -> Result<Option<Job>, StoreError> {
        Ok(queries::update_job_flags(&self.pool, job_id, &flags).await?)
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(queries::find_stale_jobs(&self.pool, older_than).await?)
    }
}
