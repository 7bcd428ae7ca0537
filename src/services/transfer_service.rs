use crate::api::error::AppError;
use crate::models::SendFileRequest;
use crate::services::codec;
use crate::services::dispatcher::{Dispatched, Dispatcher};
use crate::services::staging::TempStaging;
use crate::utils::validation::validate_filename;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReceipt {
    /// The file is on the remote server at this path.
    Delivered(String),
    Queued(Uuid),
}

/// Request pipeline: validate, decode, stage, dispatch.
pub struct TransferService {
    staging: TempStaging,
    dispatcher: Arc<Dispatcher>,
}

impl TransferService {
    pub fn new(staging: TempStaging, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            staging,
            dispatcher,
        }
    }

    pub fn staging(&self) -> &TempStaging {
        &self.staging
    }

    pub async fn send(&self, request: SendFileRequest) -> Result<TransferReceipt, AppError> {
        // Rejected names never reach the decoder or the disk
        let filename = validate_filename(&request.filename)?;
        let bytes = codec::decode(&request.content)?;

        tracing::info!("📨 Sending {} ({} bytes)", filename, bytes.len());

        let artifact = self.staging.stage(filename, &bytes).await?;
        drop(bytes);

        match self.dispatcher.dispatch(artifact).await? {
            Dispatched::Completed(path) => Ok(TransferReceipt::Delivered(path)),
            Dispatched::Queued(id) => Ok(TransferReceipt::Queued(id)),
        }
    }
}
