//! Job lifecycle policy: the transition table shared by the dispatcher, the
//! stores and the watcher, plus [`JobPatch`], the only way job state is
//! changed.
//!
//! ```text
//! queued  ─┬─> processing ─┬─> completed
//! pending ─┘       │       └─> failed
//!    └─────────────┴─────────> failed
//! ```

use chrono::{DateTime, Utc};

use crate::models::job::{Job, JobStatus};

/// An attempted transition that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal job transition: {from} -> {to}")]
pub struct PolicyViolation {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Statuses reachable from `from`. Terminal states return an empty slice.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Queued | JobStatus::Pending => &[JobStatus::Processing, JobStatus::Failed],
        JobStatus::Processing => &[JobStatus::Completed, JobStatus::Failed],
        JobStatus::Completed | JobStatus::Failed => &[],
    }
}

/// Statuses from which `to` may be entered.
pub fn allowed_sources(to: JobStatus) -> &'static [JobStatus] {
    match to {
        JobStatus::Processing => &[JobStatus::Queued, JobStatus::Pending],
        JobStatus::Completed => &[JobStatus::Processing],
        JobStatus::Failed => &[JobStatus::Queued, JobStatus::Pending, JobStatus::Processing],
        JobStatus::Queued | JobStatus::Pending => &[],
    }
}

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), PolicyViolation> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(PolicyViolation { from, to })
    }
}

/// A state change for one job. Constructors keep the timestamp and outcome
/// invariants: `started_at` only on entering `processing`, `completed_at`
/// only on entering a terminal state, result URL only with `completed`,
/// error message only with `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub(crate) status: JobStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) result_image: Option<String>,
    pub(crate) ai_model_used: Option<String>,
    pub(crate) prompt_version: Option<i32>,
    pub(crate) pipeline_version: Option<i32>,
    pub(crate) error_message: Option<String>,
}

impl JobPatch {
    pub fn start(at: DateTime<Utc>, prompt_version: i32, pipeline_version: i32) -> Self {
        Self {
            status: JobStatus::Processing,
            started_at: Some(at),
            completed_at: None,
            result_image: None,
            ai_model_used: None,
            prompt_version: Some(prompt_version),
            pipeline_version: Some(pipeline_version),
            error_message: None,
        }
    }

    pub fn complete(at: DateTime<Utc>, result_url: String, ai_model: String) -> Self {
        Self {
            status: JobStatus::Completed,
            started_at: None,
            completed_at: Some(at),
            result_image: Some(result_url),
            ai_model_used: Some(ai_model),
            prompt_version: None,
            pipeline_version: None,
            error_message: None,
        }
    }

    pub fn fail(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            started_at: None,
            completed_at: Some(at),
            result_image: None,
            ai_model_used: None,
            prompt_version: None,
            pipeline_version: None,
            error_message: Some(message.into()),
        }
    }

    /// Record the model that was attempted on a failure.
    pub fn with_model(mut self, ai_model: impl Into<String>) -> Self {
        self.ai_model_used = Some(ai_model.into());
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Apply the patch to `job` if the transition is legal. Timestamps that
    /// are already set are never overwritten.
    pub fn apply_to(&self, job: &mut Job) -> Result<(), PolicyViolation> {
        validate_transition(job.status, self.status)?;

        job.status = self.status;
        if job.started_at.is_none() {
            job.started_at = self.started_at;
        }
        if job.completed_at.is_none() {
            job.completed_at = self.completed_at;
        }
        // Clamp so started <= completed even across clock skew.
        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
            if completed < started {
                job.completed_at = Some(started);
            }
        }
        if self.result_image.is_some() {
            job.result_image = self.result_image.clone();
        }
        if self.ai_model_used.is_some() {
            job.ai_model_used = self.ai_model_used.clone();
        }
        if self.prompt_version.is_some() {
            job.prompt_version = self.prompt_version;
        }
        if self.pipeline_version.is_some() {
            job.pipeline_version = self.pipeline_version;
        }
        if self.error_message.is_some() {
            job.error_message = self.error_message.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::NewJob;
    use uuid::Uuid;

    use JobStatus::*;

    fn queued_job() -> Job {
        Job::from_submission(NewJob {
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            model_id: Uuid::new_v4(),
            style: "studio".to_string(),
            user_instructions: None,
            ai_model: None,
        })
    }

    // -----------------------------------------------------------------------
    // Legal transitions
    // -----------------------------------------------------------------------

    #[test]
    fn queued_to_processing() {
        assert!(can_transition(Queued, Processing));
    }

    #[test]
    fn queued_to_failed() {
        assert!(can_transition(Queued, Failed));
    }

    #[test]
    fn pending_to_processing() {
        assert!(can_transition(Pending, Processing));
    }

    #[test]
    fn pending_to_failed() {
        assert!(can_transition(Pending, Failed));
    }

    #[test]
    fn processing_to_completed() {
        assert!(can_transition(Processing, Completed));
    }

    #[test]
    fn processing_to_failed() {
        assert!(can_transition(Processing, Failed));
    }

    // -----------------------------------------------------------------------
    // Illegal transitions
    // -----------------------------------------------------------------------

    const ILLEGAL: &[(JobStatus, JobStatus)] = &[
        (Queued, Queued),
        (Queued, Pending),
        (Queued, Completed),
        (Pending, Queued),
        (Pending, Pending),
        (Pending, Completed),
        (Processing, Queued),
        (Processing, Pending),
        (Processing, Processing),
        (Completed, Queued),
        (Completed, Pending),
        (Completed, Processing),
        (Completed, Completed),
        (Completed, Failed),
        (Failed, Queued),
        (Failed, Pending),
        (Failed, Processing),
        (Failed, Completed),
        (Failed, Failed),
    ];

    #[test]
    fn every_illegal_pair_is_rejected() {
        for &(from, to) in ILLEGAL {
            assert_eq!(
                validate_transition(from, to),
                Err(PolicyViolation { from, to }),
                "{from} -> {to} must be rejected"
            );
        }
    }

    #[test]
    fn table_covers_every_pair() {
        let legal = JobStatus::ALL
            .iter()
            .flat_map(|&from| JobStatus::ALL.iter().map(move |&to| (from, to)))
            .filter(|&(from, to)| can_transition(from, to))
            .count();
        assert_eq!(legal + ILLEGAL.len(), 25);
        assert_eq!(legal, 6);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(valid_transitions(Completed).is_empty());
        assert!(valid_transitions(Failed).is_empty());
    }

    #[test]
    fn allowed_sources_mirror_the_table() {
        for to in JobStatus::ALL {
            for from in JobStatus::ALL {
                assert_eq!(
                    allowed_sources(to).contains(&from),
                    can_transition(from, to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn violation_message_names_both_states() {
        let err = validate_transition(Completed, Processing).unwrap_err();
        assert_eq!(err.to_string(), "Illegal job transition: completed -> processing");
    }

    // -----------------------------------------------------------------------
    // Patches
    // -----------------------------------------------------------------------

    #[test]
    fn start_sets_started_at_only() {
        let mut job = queued_job();
        let now = Utc::now();
        JobPatch::start(now, 3, 2).apply_to(&mut job).unwrap();
        assert_eq!(job.status, Processing);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.completed_at, None);
        assert_eq!(job.prompt_version, Some(3));
        assert_eq!(job.pipeline_version, Some(2));
    }

    #[test]
    fn complete_sets_result_and_completed_at() {
        let mut job = queued_job();
        let now = Utc::now();
        JobPatch::start(now, 1, 1).apply_to(&mut job).unwrap();
        JobPatch::complete(now, "https://cdn/x.png".into(), "gemini".into())
            .apply_to(&mut job)
            .unwrap();
        assert_eq!(job.status, Completed);
        assert_eq!(job.result_image.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(job.error_message, None);
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }

    #[test]
    fn fail_from_queued_leaves_started_at_unset() {
        let mut job = queued_job();
        JobPatch::fail(Utc::now(), "boom").apply_to(&mut job).unwrap();
        assert_eq!(job.status, Failed);
        assert_eq!(job.started_at, None);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.result_image, None);
    }

    #[test]
    fn terminal_job_is_immutable() {
        let mut job = queued_job();
        JobPatch::fail(Utc::now(), "first").apply_to(&mut job).unwrap();
        let before = job.clone();

        let err = JobPatch::complete(Utc::now(), "u".into(), "m".into()).apply_to(&mut job);
        assert!(err.is_err());
        let err = JobPatch::fail(Utc::now(), "second").apply_to(&mut job);
        assert!(err.is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn completed_never_precedes_started() {
        let mut job = queued_job();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);
        JobPatch::start(later, 1, 1).apply_to(&mut job).unwrap();
        JobPatch::fail(earlier, "skew").apply_to(&mut job).unwrap();
        assert_eq!(job.completed_at, Some(later));
    }
}
