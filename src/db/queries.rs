use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobFlags, JobStatus, NewJob};
use crate::services::lifecycle::{self, JobPatch};

const JOB_COLUMNS: &str = r#"
    id, user_id, product_id, model_id, style, user_instructions, status,
    result_image, ai_model_used, prompt_version, pipeline_version, error_message,
    created_at, started_at, completed_at, is_favorite, is_public
"#;

fn parse_status(raw: &str) -> Result<JobStatus, sqlx::Error> {
    JobStatus::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        model_id: row.try_get("model_id")?,
        style: row.try_get("style")?,
        user_instructions: row.try_get("user_instructions")?,
        status: parse_status(&status)?,
        result_image: row.try_get("result_image")?,
        ai_model_used: row.try_get("ai_model_used")?,
        prompt_version: row.try_get("prompt_version")?,
        pipeline_version: row.try_get("pipeline_version")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        is_favorite: row.try_get("is_favorite")?,
        is_public: row.try_get("is_public")?,
    })
}

/// Insert a new job at `queued`
pub async fn create_job(pool: &PgPool, new_job: &NewJob) -> Result<Job, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO tryon_jobs (user_id, product_id, model_id, style, user_instructions, status)
        VALUES ($1, $2, $3, $4, $5, 'queued')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(new_job.user_id)
    .bind(new_job.product_id)
    .bind(new_job.model_id)
    .bind(&new_job.style)
    .bind(&new_job.user_instructions)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM tryon_jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Current status only
pub async fn get_job_status(pool: &PgPool, job_id: Uuid) -> Result<Option<JobStatus>, sqlx::Error> {
    let row = sqlx::query("SELECT status FROM tryon_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let status: String = r.try_get("status")?;
            Ok(Some(parse_status(&status)?))
        }
        None => Ok(None),
    }
}

/// Conditionally apply a lifecycle patch. Returns `None` when the job's
/// current status is not an allowed source for the target status (or the
/// job does not exist).
pub async fn apply_patch(
    pool: &PgPool,
    job_id: Uuid,
    patch: &JobPatch,
) -> Result<Option<Job>, sqlx::Error> {
    let sources: Vec<String> = lifecycle::allowed_sources(patch.status)
        .iter()
        .map(|s| s.to_string())
        .collect();

    let row = sqlx::query(&format!(
        r#"
        UPDATE tryon_jobs
        SET status = $2,
            started_at = COALESCE(started_at, $3),
            completed_at = CASE
                WHEN completed_at IS NOT NULL THEN completed_at
                WHEN $4::timestamptz IS NULL THEN NULL
                ELSE GREATEST($4, COALESCE(started_at, $3, $4))
            END,
            result_image = COALESCE($5, result_image),
            ai_model_used = COALESCE($6, ai_model_used),
            prompt_version = COALESCE($7, prompt_version),
            pipeline_version = COALESCE($8, pipeline_version),
            error_message = COALESCE($9, error_message)
        WHERE id = $1 AND status = ANY($10)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(patch.status.to_string())
    .bind(patch.started_at)
    .bind(patch.completed_at)
    .bind(&patch.result_image)
    .bind(&patch.ai_model_used)
    .bind(patch.prompt_version)
    .bind(patch.pipeline_version)
    .bind(&patch.error_message)
    .bind(&sources)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Jobs of one owner, newest first
pub async fn list_jobs_for_user(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM tryon_jobs
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#
    ))
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Update favorite/public flags
pub async fn update_job_flags(
    pool: &PgPool,
    job_id: Uuid,
    flags: &JobFlags,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE tryon_jobs
        SET is_favorite = COALESCE($2, is_favorite),
            is_public = COALESCE($3, is_public)
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(flags.is_favorite)
    .bind(flags.is_public)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Non-terminal jobs created before the cutoff (stuck detection)
pub async fn find_stale_jobs(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM tryon_jobs
        WHERE status NOT IN ('completed', 'failed')
          AND created_at < $1
        ORDER BY created_at ASC
        "#
    ))
    .bind(older_than)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Storage key and content type of an uploaded asset
pub async fn get_asset(
    pool: &PgPool,
    asset_id: Uuid,
) -> Result<Option<(String, String)>, sqlx::Error> {
    let row = sqlx::query("SELECT storage_key, content_type FROM assets WHERE id = $1")
        .bind(asset_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(Some((r.try_get("storage_key")?, r.try_get("content_type")?))),
        None => Ok(None),
    }
}

/// A user's stored AI model preference
pub async fn get_preferred_model(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT preferred_ai_model FROM user_preferences WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => r.try_get("preferred_ai_model"),
        None => Ok(None),
    }
}
