pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::GatewayConfig;
use crate::services::dispatcher::{Dispatcher, UploadExecutor};
use crate::services::session_pool::{PoolConfig, SessionPool};
use crate::services::sftp::{Credentials, SessionKey, SftpConnector};
use crate::services::staging::TempStaging;
use crate::services::transfer_service::TransferService;
use crate::services::uploader::RemoteUploader;
use anyhow::Context;
use axum::{
    Router,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::sftp::send_file,
        api::handlers::sftp::get_job,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            models::SendFileRequest,
            models::UploadResult,
            models::UploadStatus,
            models::UploadJob,
            models::JobState,
            api::handlers::health::HealthResponse,
            services::session_pool::PoolStats,
        )
    ),
    tags(
        (name = "sftp", description = "File delivery to the SFTP server"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub transfer_service: Arc<TransferService>,
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<SessionPool>,
}

impl AppState {
    /// Wires the upload pipeline for `config` over `connector`. In async
    /// dispatch mode this starts the queue consumer.
    pub fn new(config: GatewayConfig, connector: Arc<dyn SftpConnector>) -> anyhow::Result<Self> {
        let credentials = Credentials::from_config(&config)
            .context("no SFTP credentials configured: set SFTP_PASSWORD or SFTP_PRIVATE_KEY")?;

        let pool = Arc::new(SessionPool::new(connector, PoolConfig::from(&config)));
        let executor = Arc::new(UploadExecutor::new(
            pool.clone(),
            RemoteUploader::new(&config),
            SessionKey::from_config(&config),
            credentials,
        ));
        let dispatcher = Arc::new(Dispatcher::new(&config, executor));
        let transfer_service = Arc::new(TransferService::new(
            TempStaging::new(&config.local_temp_path),
            dispatcher.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            transfer_service,
            dispatcher,
            pool,
        })
    }

    /// Drains queued uploads, then closes every pooled session.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.pool.close_all().await;
    }
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.max_payload_size;

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/sftp/send", post(api::handlers::sftp::send_file))
        .route("/sftp/jobs/:id", get(api::handlers::sftp::get_job))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
