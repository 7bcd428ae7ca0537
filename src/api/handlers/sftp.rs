use crate::AppState;
use crate::api::error::AppError;
use crate::models::{SendFileRequest, UploadJob, UploadResult};
use crate::services::transfer_service::TransferReceipt;
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use uuid::Uuid;
use validator::Validate;

#[utoipa::path(
    post,
    path = "/sftp/send",
    request_body = SendFileRequest,
    responses(
        (status = 200, description = "File delivered to the SFTP server", body = UploadResult),
        (status = 202, description = "Upload queued; the body carries the job id", body = UploadResult),
        (status = 400, description = "Malformed request, invalid filename or content", body = UploadResult),
        (status = 413, description = "Request body too large", body = UploadResult),
        (status = 500, description = "Local staging failed", body = UploadResult),
        (status = 502, description = "Connection, authentication or transfer failed", body = UploadResult),
        (status = 503, description = "Upload queue is full", body = UploadResult)
    ),
    tag = "sftp"
)]
pub async fn send_file(
    State(state): State<AppState>,
    payload: Result<Json<SendFileRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UploadResult>), AppError> {
    let Json(request) = payload.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge {
                limit: state.config.max_payload_size,
            }
        } else {
            AppError::BadRequest(e.body_text())
        }
    })?;
    request
        .validate()
        .map_err(|e| AppError::InvalidFilename(e.to_string()))?;

    match state.transfer_service.send(request).await? {
        TransferReceipt::Delivered(_) => Ok((StatusCode::OK, Json(UploadResult::success()))),
        TransferReceipt::Queued(job_id) => Ok((
            StatusCode::ACCEPTED,
            Json(UploadResult::accepted(job_id)),
        )),
    }
}

#[utoipa::path(
    get,
    path = "/sftp/jobs/{id}",
    params(
        ("id" = String, Path, description = "Job id returned by a queued send")
    ),
    responses(
        (status = 200, description = "Job state and result", body = UploadJob),
        (status = 400, description = "Malformed job id", body = UploadResult),
        (status = 404, description = "Unknown or purged job", body = UploadResult)
    ),
    tag = "sftp"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadJob>, AppError> {
    let job_id = Uuid::parse_str(&id)
        .map_err(|_| AppError::BadRequest(format!("'{}' is not a job id", id)))?;

    state
        .dispatcher
        .job(job_id)
        .map(Json)
        .ok_or(AppError::JobNotFound(id))
}
