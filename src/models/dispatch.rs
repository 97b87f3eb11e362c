use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobStatus;

/// Body of the dispatch trigger, also the payload carried on the queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessJobRequest {
    #[garde(skip)]
    pub job_id: Uuid,

    /// Per-job model override. Takes precedence over the user's preference.
    #[garde(length(min = 1, max = 128))]
    #[serde(default)]
    pub ai_model: Option<String>,
}

/// Response of the dispatch trigger. Reports whether the dispatch was
/// accepted, not how the job turned out.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Query string of the long-poll endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitQuery {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub user_id: Uuid,
    #[serde(default)]
    pub limit: Option<i64>,
}
