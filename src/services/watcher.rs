//! Job watcher: observes one job until it finishes or a timeout elapses.
//!
//! A [`JobWatcher`] owns at most one observation session. The session is a
//! spawned task that owns the poll interval and the change subscription, so
//! stopping the session (abort) releases both at once.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::services::store::{JobStore, JobSubscription};

/// How the watcher learns about changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WatchMode {
    /// Change notifications from the store. Falls back to polling when the
    /// store has none.
    Push,
    /// Timed re-fetches.
    Poll,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub job_id: Uuid,
    pub mode: WatchMode,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WatchConfig {
    pub fn new(job_id: Uuid, mode: WatchMode) -> Self {
        Self {
            job_id,
            mode,
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One observed status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Why observation ended without success.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchFailure {
    /// The job itself reported failure.
    JobFailed(Job),
    /// The watcher gave up; the job may still be running server-side.
    TimedOut {
        job_id: Uuid,
        elapsed: Duration,
        last_status: Option<JobStatus>,
    },
}

impl WatchFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WatchFailure::TimedOut { .. })
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchFailure::JobFailed(job) => f.write_str(
                job.error_message
                    .as_deref()
                    .unwrap_or("Job failed without an error message"),
            ),
            WatchFailure::TimedOut {
                job_id,
                elapsed,
                last_status,
            } => {
                write!(
                    f,
                    "Timed out after {}ms waiting for job {}",
                    elapsed.as_millis(),
                    job_id
                )?;
                if let Some(status) = last_status {
                    write!(f, " (last status: {status})")?;
                }
                Ok(())
            }
        }
    }
}

/// Lifecycle callbacks. Invoked from the observation task.
pub trait WatchObserver: Send + Sync {
    /// Status changed from `previous` to `job.status`. Never called for the
    /// first observation.
    fn on_transition(&self, _job: &Job, _previous: JobStatus) {}

    /// Job reached `completed`. Called at most once per session.
    fn on_completed(&self, _job: &Job) {}

    /// Job reached `failed`, or the watch timed out. Called at most once per
    /// session.
    fn on_failed(&self, _failure: &WatchFailure) {}
}

/// Outcome of feeding one observation to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    First,
    Unchanged,
    Changed(StatusTransition),
    /// Older than what was already seen (e.g. a stale poll); ignored.
    Regressed,
}

/// Last-seen status plus the transition history.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<JobStatus>,
    history: Vec<StatusTransition>,
}

impl StatusTracker {
    pub fn observe(&mut self, status: JobStatus) -> Observation {
        match self.last {
            None => {
                self.last = Some(status);
                Observation::First
            }
            Some(last) if last == status => Observation::Unchanged,
            Some(last) if status.rank() < last.rank() || last.is_terminal() => Observation::Regressed,
            Some(last) => {
                let transition = StatusTransition { from: last, to: status };
                self.last = Some(status);
                self.history.push(transition);
                Observation::Changed(transition)
            }
        }
    }

    pub fn last(&self) -> Option<JobStatus> {
        self.last
    }

    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }
}

struct ObservationSession {
    task: JoinHandle<()>,
}

/// Watches one job. Only one observation is active at a time.
pub struct JobWatcher {
    store: Arc<dyn JobStore>,
    config: WatchConfig,
    observer: Arc<dyn WatchObserver>,
    history: Arc<Mutex<Vec<StatusTransition>>>,
    session: Option<ObservationSession>,
}

impl JobWatcher {
    pub fn new(store: Arc<dyn JobStore>, config: WatchConfig, observer: Arc<dyn WatchObserver>) -> Self {
        Self {
            store,
            config,
            observer,
            history: Arc::new(Mutex::new(Vec::new())),
            session: None,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Start observing. A no-op while a session is still active.
    pub fn start(&mut self) {
        if self.is_watching() {
            tracing::debug!(job_id = %self.config.job_id, "Watcher already active");
            return;
        }
        self.stop();

        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }

        let session = Session {
            store: self.store.clone(),
            config: self.config.clone(),
            observer: self.observer.clone(),
            history: self.history.clone(),
            tracker: StatusTracker::default(),
            started: Instant::now(),
        };
        self.session = Some(ObservationSession {
            task: tokio::spawn(session.run()),
        });
    }

    /// Stop observing. Idempotent.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }

    /// Wait for the current session to end on its own.
    pub async fn finished(&mut self) {
        if let Some(session) = self.session.as_mut() {
            let _ = (&mut session.task).await;
        }
        self.session = None;
    }

    /// Transitions observed in the current (or last) session.
    pub fn history(&self) -> Vec<StatusTransition> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Drop for JobWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Step {
    Continue,
    Stop,
}

/// State owned by the observation task.
struct Session {
    store: Arc<dyn JobStore>,
    config: WatchConfig,
    observer: Arc<dyn WatchObserver>,
    history: Arc<Mutex<Vec<StatusTransition>>>,
    tracker: StatusTracker,
    started: Instant,
}

impl Session {
    async fn run(mut self) {
        let job_id = self.config.job_id;
        let deadline = self.started + self.config.timeout;

        // Subscribe before the first fetch so no change slips between them.
        let mut subscription = match self.config.mode {
            WatchMode::Push => self.open_subscription().await,
            WatchMode::Poll => None,
        };

        let initial = self.fetch().await;
        if let Step::Stop = self.handle(initial) {
            return;
        }

        let mut interval = if subscription.is_none() {
            let mut interval = tokio::time::interval_at(
                Instant::now() + self.config.poll_interval,
                self.config.poll_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        } else {
            None
        };

        loop {
            let update = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => None,
                _ = tick(&mut interval) => self.fetch().await,
                event = next_event(&mut subscription) => match event {
                    Some(job) => Some(job),
                    None => {
                        tracing::warn!(job_id = %job_id, "Subscription closed, falling back to polling");
                        subscription = None;
                        interval = Some(tokio::time::interval(self.config.poll_interval));
                        None
                    }
                },
            };
            if let Step::Stop = self.handle(update) {
                return;
            }
        }
    }

    async fn open_subscription(&self) -> Option<JobSubscription> {
        match self.store.subscribe(self.config.job_id).await {
            Ok(Some(subscription)) => Some(subscription),
            Ok(None) => {
                tracing::info!(job_id = %self.config.job_id, "Store has no change feed, polling instead");
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %self.config.job_id, error = %e, "Subscribe failed, polling instead");
                None
            }
        }
    }

    /// Fetch errors count as "no update this cycle".
    async fn fetch(&self) -> Option<Job> {
        match self.store.get(self.config.job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %self.config.job_id, error = %e, "Job fetch failed");
                None
            }
        }
    }

    /// Shared update handler for the initial fetch, polls and push events.
    fn handle(&mut self, update: Option<Job>) -> Step {
        if let Some(job) = update {
            match self.tracker.observe(job.status) {
                Observation::Changed(transition) => {
                    if let Ok(mut history) = self.history.lock() {
                        history.push(transition);
                    }
                    tracing::debug!(
                        job_id = %job.id,
                        from = %transition.from,
                        to = %transition.to,
                        "Observed job transition"
                    );
                    self.observer.on_transition(&job, transition.from);
                }
                Observation::Regressed => {
                    tracing::debug!(job_id = %job.id, status = %job.status, "Ignoring stale observation");
                    return self.check_timeout();
                }
                Observation::First | Observation::Unchanged => {}
            }

            let status = job.status;
            match status {
                JobStatus::Completed => {
                    self.observer.on_completed(&job);
                    return Step::Stop;
                }
                JobStatus::Failed => {
                    self.observer.on_failed(&WatchFailure::JobFailed(job));
                    return Step::Stop;
                }
                _ => {}
            }
        }

        self.check_timeout()
    }

    fn check_timeout(&self) -> Step {
        let elapsed = self.started.elapsed();
        if elapsed < self.config.timeout {
            return Step::Continue;
        }
        let failure = WatchFailure::TimedOut {
            job_id: self.config.job_id,
            elapsed,
            last_status: self.tracker.last(),
        };
        tracing::warn!(job_id = %self.config.job_id, elapsed_ms = elapsed.as_millis() as u64, "Watch timed out");
        self.observer.on_failed(&failure);
        Step::Stop
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_event(subscription: &mut Option<JobSubscription>) -> Option<Job> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn first_observation_is_not_a_transition() {
        let mut tracker = StatusTracker::default();
        assert_eq!(tracker.observe(Queued), Observation::First);
        assert!(tracker.history().is_empty());
    }

    #[test]
    fn changes_are_recorded_in_order() {
        let mut tracker = StatusTracker::default();
        tracker.observe(Queued);
        assert_eq!(tracker.observe(Queued), Observation::Unchanged);
        assert_eq!(
            tracker.observe(Processing),
            Observation::Changed(StatusTransition { from: Queued, to: Processing })
        );
        tracker.observe(Completed);
        assert_eq!(
            tracker.history(),
            &[
                StatusTransition { from: Queued, to: Processing },
                StatusTransition { from: Processing, to: Completed },
            ]
        );
    }

    #[test]
    fn stale_observations_are_ignored() {
        let mut tracker = StatusTracker::default();
        tracker.observe(Processing);
        assert_eq!(tracker.observe(Queued), Observation::Regressed);
        assert_eq!(tracker.last(), Some(Processing));
    }

    #[test]
    fn terminal_never_reverts() {
        let mut tracker = StatusTracker::default();
        tracker.observe(Completed);
        assert_eq!(tracker.observe(Processing), Observation::Regressed);
        assert_eq!(tracker.observe(Failed), Observation::Regressed);
        assert_eq!(tracker.last(), Some(Completed));
    }

    #[test]
    fn timeout_message_is_specific() {
        let failure = WatchFailure::TimedOut {
            job_id: Uuid::nil(),
            elapsed: Duration::from_millis(100),
            last_status: Some(Processing),
        };
        assert!(failure.is_timeout());
        assert_eq!(
            failure.message(),
            "Timed out after 100ms waiting for job 00000000-0000-0000-0000-000000000000 (last status: processing)"
        );
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("PUSH".parse::<WatchMode>().unwrap(), WatchMode::Push);
        assert_eq!("poll".parse::<WatchMode>().unwrap(), WatchMode::Poll);
    }
}
