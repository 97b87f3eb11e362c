use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use tryon_jobs::{
    config::AppConfig,
    db,
    services::{
        assets::{HttpAssetFetcher, PgAssetResolver, PgUserPreferences},
        dispatcher::{DispatchOutcome, Dispatcher, DispatcherDeps},
        providers::{gemini::GeminiClient, ProviderRegistry},
        queue::DispatchQueue,
        storage::R2Client,
        store::{JobStore, PgJobStore},
    },
};

/// How often stuck jobs are looked for.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting try-on dispatch worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let r2_client = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            &config.r2_public_base_url,
        )
        .expect("Failed to initialize R2 client"),
    );
    if let Err(e) = r2_client.health_check().await {
        tracing::warn!(error = %e, "R2 bucket not reachable at startup");
    }

    let queue = DispatchQueue::new(&config.redis_url).expect("Failed to initialize dispatch queue");

    let gemini = GeminiClient::new(
        &config.gemini_api_base,
        &config.gemini_api_key,
        config.generation_timeout(),
    )
    .expect("Failed to initialize Gemini client");

    let fetcher = HttpAssetFetcher::new(config.asset_fetch_timeout())
        .expect("Failed to initialize asset fetcher");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let dispatcher = Dispatcher::new(DispatcherDeps {
        store: store.clone(),
        resolver: Arc::new(PgAssetResolver::new(
            db_pool.clone(),
            r2_client.clone(),
            config.asset_url_ttl_secs,
        )),
        fetcher: Arc::new(fetcher),
        writer: r2_client,
        preferences: Arc::new(PgUserPreferences::new(db_pool)),
        providers: ProviderRegistry::new(Arc::new(gemini), config.default_ai_model.clone()),
    });

    tracing::info!(default_model = %config.default_ai_model, "Worker ready, starting dispatch loop");

    let poll_interval = config.worker_poll_interval();
    let stale_threshold = config.stale_job_threshold();
    let mut last_sweep: Option<Instant> = None;

    loop {
        if last_sweep.map_or(true, |at| at.elapsed() >= STALE_SWEEP_INTERVAL) {
            report_stale_jobs(store.as_ref(), stale_threshold).await;
            last_sweep = Some(Instant::now());
        }

        match process_next(&queue, &dispatcher).await {
            Ok(true) => {
                tracing::debug!("Dispatch handled, checking for next request");
            }
            Ok(false) => {
                tracing::trace!("No dispatch requests, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Dispatch queue error");
                sleep(poll_interval).await;
            }
        }
    }
}

/// Handle the next dispatch request.
/// Returns Ok(true) if a request was handled, Ok(false) if the queue was empty.
async fn process_next(
    queue: &DispatchQueue,
    dispatcher: &Dispatcher,
) -> Result<bool, Box<dyn std::error::Error>> {
    let Some(entry) = queue.dequeue().await? else {
        return Ok(false);
    };

    match &entry.request {
        None => {
            // No job id to fail; drop the payload.
            tracing::error!("Discarding undecodable dispatch payload");
        }
        Some(request) => {
            tracing::info!(job_id = %request.job_id, "Dispatching job");
            match dispatcher
                .process_job(request.job_id, request.ai_model.as_deref())
                .await
            {
                Ok(DispatchOutcome::Completed(job)) => {
                    tracing::info!(job_id = %job.id, result = ?job.result_image, "Dispatch finished: completed");
                }
                Ok(DispatchOutcome::Failed(job)) => {
                    tracing::warn!(job_id = %job.id, error = ?job.error_message, "Dispatch finished: failed");
                }
                Ok(DispatchOutcome::Skipped { status }) => {
                    tracing::info!(job_id = %request.job_id, status = %status, "Dispatch skipped");
                }
                Err(e) => {
                    tracing::error!(job_id = %request.job_id, error = %e, "Dispatch could not update job");
                }
            }
        }
    }

    // One attempt per job: the entry is never re-queued.
    queue.complete(&entry).await?;
    Ok(true)
}

/// Log non-terminal jobs that are older than the threshold. Read only.
async fn report_stale_jobs(store: &dyn JobStore, threshold: Duration) {
    let cutoff = match chrono::Duration::from_std(threshold) {
        Ok(age) => Utc::now() - age,
        Err(_) => return,
    };

    match store.find_stale(cutoff).await {
        Ok(stale) => {
            metrics::gauge!("tryon_stale_jobs").set(stale.len() as f64);
            for job in &stale {
                tracing::warn!(
                    job_id = %job.id,
                    status = %job.status,
                    created_at = %job.created_at,
                    "Job appears stuck"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Stale job sweep failed"),
    }
}
