use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a try-on job.
///
/// `Queued` and `Pending` are both "not yet started" and behave identically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Coarse progress rank: not started, running, finished.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued | JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

/// A virtual try-on job: a model photo plus a garment photo in, one
/// composited image out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Garment asset.
    pub product_id: Uuid,
    /// Human model asset (not the AI model).
    pub model_id: Uuid,
    pub style: String,
    #[serde(default)]
    pub user_instructions: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub result_image: Option<String>,
    #[serde(default)]
    pub ai_model_used: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<i32>,
    #[serde(default)]
    pub pipeline_version: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub is_favorite: bool,
    pub is_public: bool,
}

impl Job {
    /// Build a fresh `queued` job from a submission.
    pub fn from_submission(new: NewJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            product_id: new.product_id,
            model_id: new.model_id,
            style: new.style,
            user_instructions: new.user_instructions,
            status: JobStatus::Queued,
            result_image: None,
            ai_model_used: None,
            prompt_version: None,
            pipeline_version: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            is_favorite: false,
            is_public: false,
        }
    }
}

/// Job submission as accepted from the UI.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[garde(skip)]
    pub user_id: Uuid,

    #[garde(skip)]
    pub product_id: Uuid,

    #[garde(skip)]
    pub model_id: Uuid,

    #[garde(length(min = 1, max = 64))]
    pub style: String,

    #[garde(length(max = 2000))]
    pub user_instructions: Option<String>,

    /// Optional per-job AI model override, forwarded to the dispatcher.
    #[garde(length(min = 1, max = 128))]
    #[serde(default)]
    pub ai_model: Option<String>,
}

/// UI-only flags. Never touched by the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFlags {
    pub is_favorite: Option<bool>,
    pub is_public: Option<bool>,
}
