use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use garde::Validate;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::dispatch::{DispatchAccepted, ListQuery, ProcessJobRequest, WaitQuery};
use crate::models::job::{Job, JobFlags, NewJob};
use crate::services::lifecycle::JobPatch;
use crate::services::watcher::{JobWatcher, WatchConfig, WatchFailure, WatchMode, WatchObserver};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const UNDISPATCHED_MESSAGE: &str = "Job could not be dispatched; please resubmit";

/// POST /api/v1/jobs: create a job at `queued` and dispatch it.
pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), StatusCode> {
    body.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let ai_model = body.ai_model.clone();
    let job = state.store.create(body).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to create job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    metrics::counter!("tryon_jobs_created_total").increment(1);

    let request = ProcessJobRequest {
        job_id: job.id,
        ai_model,
    };
    if let Err(e) = state.queue.enqueue(&request).await {
        tracing::error!(job_id = %job.id, error = %e, "Job created but dispatch enqueue failed");
        // Nothing will ever pick the job up; close it so retries do not leave
        // an orphan behind.
        let patch = JobPatch::fail(Utc::now(), UNDISPATCHED_MESSAGE);
        if let Err(e) = state.store.update(job.id, patch).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to mark undispatched job as failed");
        }
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    tracing::info!(job_id = %job.id, user_id = %job.user_id, "Job created and dispatched");
    Ok((StatusCode::CREATED, Json(job)))
}

/// POST /api/v1/jobs/process: dispatch trigger. Only reports whether the
/// dispatch was accepted; the job outcome is observed through the store.
pub async fn process_job(
    State(state): State<AppState>,
    body: Result<Json<ProcessJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchAccepted>), StatusCode> {
    // Without a decodable body there is no job id, so nothing to update.
    let Json(request) = body.map_err(|e| {
        tracing::warn!(error = %e, "Rejected malformed dispatch request");
        StatusCode::BAD_REQUEST
    })?;
    request.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let job = state
        .store
        .get(request.job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %request.job_id, error = %e, "Job lookup failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    state.queue.enqueue(&request).await.map_err(|e| {
        tracing::error!(job_id = %job.id, error = %e, "Dispatch enqueue failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    tracing::info!(job_id = %job.id, status = %job.status, "Dispatch accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchAccepted {
            job_id: job.id,
            status: job.status,
            message: "Job dispatched for processing".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, StatusCode> {
    state
        .store
        .get(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Job lookup failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/v1/jobs?userId=: a user's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    state
        .store
        .list_by_owner(query.user_id, limit)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(user_id = %query.user_id, error = %e, "Job listing failed");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

/// PATCH /api/v1/jobs/{job_id}/flags: favorite/public only.
pub async fn update_flags(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(flags): Json<JobFlags>,
) -> Result<Json<Job>, StatusCode> {
    state
        .store
        .set_flags(job_id, flags)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Flag update failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Forwards the first terminal callback to a waiting request.
struct OneshotObserver {
    tx: Mutex<Option<oneshot::Sender<Result<Job, WatchFailure>>>>,
}

impl OneshotObserver {
    fn send(&self, outcome: Result<Job, WatchFailure>) {
        if let Some(tx) = self.tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(outcome);
        }
    }
}

impl WatchObserver for OneshotObserver {
    fn on_completed(&self, job: &Job) {
        self.send(Ok(job.clone()));
    }

    fn on_failed(&self, failure: &WatchFailure) {
        self.send(Err(failure.clone()));
    }
}

/// GET /api/v1/jobs/{job_id}/wait: long-poll until the job finishes.
/// Failed jobs are returned like completed ones; 504 on watch timeout.
pub async fn wait_for_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let mode = match query.mode.as_deref() {
        None => WatchMode::Push,
        Some(raw) => raw
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("Unknown watch mode \"{raw}\"")))?,
    };
    let timeout = query
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.max_watch)
        .min(state.max_watch);

    match state.store.get(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err((StatusCode::NOT_FOUND, format!("Job {job_id} not found"))),
        Err(e) => return Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }

    let (tx, rx) = oneshot::channel();
    let observer = Arc::new(OneshotObserver {
        tx: Mutex::new(Some(tx)),
    });
    let config = WatchConfig::new(job_id, mode)
        .poll_interval(WAIT_POLL_INTERVAL)
        .timeout(timeout);

    let mut watcher = JobWatcher::new(state.store.clone(), config, observer);
    watcher.start();
    let outcome = rx.await;
    watcher.stop();

    match outcome {
        Ok(Ok(job)) => Ok(Json(job)),
        Ok(Err(WatchFailure::JobFailed(job))) => Ok(Json(job)),
        Ok(Err(failure)) => Err((StatusCode::GATEWAY_TIMEOUT, failure.message())),
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Job watch ended unexpectedly".to_string(),
        )),
    }
}
