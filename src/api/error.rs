use crate::models::UploadResult;
use crate::services::sftp::TransportError;
use crate::services::uploader::UploadState;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub const SEND_FAILED_MESSAGE: &str = "Send file by SFTP failed.";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Content is not valid base64")]
    Decode(#[source] base64::DecodeError),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Could not stage '{filename}' locally")]
    StagingIo {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect to {endpoint}")]
    Connection {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Authentication failed for {endpoint}")]
    Auth {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Transfer of '{filename}' failed during {stage}")]
    Transfer {
        filename: String,
        stage: UploadState,
        #[source]
        source: TransportError,
    },

    #[error("Upload queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl AppError {
    /// Taxonomy name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Decode(_) => "DecodeError",
            AppError::InvalidFilename(_) => "InvalidFilenameError",
            AppError::StagingIo { .. } => "StagingIOError",
            AppError::Connection { .. } => "ConnectionError",
            AppError::Auth { .. } => "AuthError",
            AppError::Transfer { .. } => "TransferError",
            AppError::QueueFull { .. } => "QueueFull",
            AppError::Unavailable(_) => "Unavailable",
            AppError::JobNotFound(_) => "JobNotFound",
            AppError::BadRequest(_) => "BadRequest",
            AppError::PayloadTooLarge { .. } => "PayloadTooLarge",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Decode(_) | AppError::InvalidFilename(_) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::StagingIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Connection { .. } | AppError::Auth { .. } | AppError::Transfer { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::QueueFull { .. } | AppError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// The error followed by its source chain, outermost first.
    pub fn details(&self) -> Vec<String> {
        let mut details = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            details.push(err.to_string());
            source = err.source();
        }
        details
    }

    pub fn to_result(&self) -> UploadResult {
        let message = match self {
            AppError::JobNotFound(_) => self.to_string(),
            _ => SEND_FAILED_MESSAGE.to_string(),
        };
        UploadResult::failure(message, self.details())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}: {}", self.kind(), self.details().join(": "));
        } else {
            tracing::warn!("{}: {}", self.kind(), self.details().join(": "));
        }

        (status, Json(self.to_result())).into_response()
    }
}
