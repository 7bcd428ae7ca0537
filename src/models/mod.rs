use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SendFileRequest {
    /// Remote file name, a single path segment
    #[validate(length(min = 1, max = 255, message = "Filename must be 1-255 characters"))]
    pub filename: String,
    /// Base64 encoded file content
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Success,
    Failure,
}

/// Outcome returned to the caller. Fields are fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadResult {
    status: UploadStatus,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
}

impl UploadResult {
    pub fn success() -> Self {
        Self {
            status: UploadStatus::Success,
            timestamp: Utc::now(),
            message: None,
            errors: Vec::new(),
            job_id: None,
        }
    }

    /// Acknowledgment for a queued upload; the final outcome is on the job.
    pub fn accepted(job_id: Uuid) -> Self {
        Self {
            status: UploadStatus::Success,
            timestamp: Utc::now(),
            message: Some("Upload queued".to_string()),
            errors: Vec::new(),
            job_id: Some(job_id),
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            status: UploadStatus::Failure,
            timestamp: Utc::now(),
            message: Some(message.into()),
            errors,
            job_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Success
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// An upload handed to the async worker set.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadJob {
    pub id: Uuid,
    pub filename: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<UploadResult>,
}

impl UploadJob {
    pub fn queued(id: Uuid, filename: String) -> Self {
        Self {
            id,
            filename,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
        }
    }
}
