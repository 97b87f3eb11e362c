use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tryon_jobs::{
    config::AppConfig,
    db,
    models::job::{JobStatus, NewJob},
    services::{
        lifecycle::JobPatch,
        store::{JobStore, PgJobStore, UpdateOutcome},
    },
};
use uuid::Uuid;

/// Integration test: Postgres job store
///
/// This test verifies against a live database:
/// 1. Migrations apply cleanly
/// 2. Conditional transitions (second claim is rejected)
/// 3. Push subscriptions via LISTEN/NOTIFY
/// 4. Terminal jobs stay immutable
///
/// Note: This requires a running PostgreSQL instance configured via
/// environment variables, with two rows in `assets` the job can reference.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_pg_job_store_lifecycle() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let pool = db::init_pool(&config.database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let user_id = Uuid::new_v4();
    let mut asset_ids = Vec::new();
    for key in ["inputs/model.jpg", "inputs/garment.jpg"] {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO assets (user_id, storage_key, content_type) VALUES ($1, $2, 'image/jpeg') RETURNING id",
        )
        .bind(user_id)
        .bind(key)
        .fetch_one(&pool)
        .await
        .expect("Failed to insert asset");
        asset_ids.push(id);
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));

    // 1. Create
    let job = store
        .create(NewJob {
            user_id,
            product_id: asset_ids[1],
            model_id: asset_ids[0],
            style: "editorial".to_string(),
            user_instructions: None,
            ai_model: None,
        })
        .await
        .expect("Failed to create job");
    assert_eq!(job.status, JobStatus::Queued);

    // 2. Subscribe, then claim
    let mut subscription = store
        .subscribe(job.id)
        .await
        .expect("Failed to subscribe")
        .expect("Postgres store supports push");

    let claimed = store
        .update(job.id, JobPatch::start(Utc::now(), 1, 1))
        .await
        .expect("Failed to claim");
    assert!(matches!(claimed, UpdateOutcome::Applied(ref j) if j.started_at.is_some()));

    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("No notification received")
        .expect("Subscription closed");
    assert_eq!(event.status, JobStatus::Processing);

    // 3. Duplicate claim is rejected
    let second = store
        .update(job.id, JobPatch::start(Utc::now(), 1, 1))
        .await
        .expect("Failed to attempt second claim");
    assert_eq!(
        second,
        UpdateOutcome::Rejected {
            current: JobStatus::Processing
        }
    );

    // 4. Complete, then terminal state is frozen
    let done = store
        .update(
            job.id,
            JobPatch::complete(Utc::now(), "https://cdn.test/r.png".into(), "gemini".into()),
        )
        .await
        .expect("Failed to complete");
    assert!(matches!(done, UpdateOutcome::Applied(_)));

    let late_failure = store
        .update(job.id, JobPatch::fail(Utc::now(), "late"))
        .await
        .expect("Failed to attempt late failure");
    assert_eq!(
        late_failure,
        UpdateOutcome::Rejected {
            current: JobStatus::Completed
        }
    );

    let listed = store.list_by_owner(user_id, 10).await.expect("Failed to list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].result_image.as_deref(), Some("https://cdn.test/r.png"));

    println!("✅ Postgres job store integration passed!");
}
