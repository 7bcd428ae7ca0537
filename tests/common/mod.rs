#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use sftp_gateway::config::{DispatchMode, GatewayConfig};
use sftp_gateway::services::memory::MemorySftpServer;
use sftp_gateway::{AppState, create_app};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub struct TestGateway {
    pub app: Router,
    pub state: AppState,
    pub server: MemorySftpServer,
    pub staging_dir: PathBuf,
    _tmp: TempDir,
}

pub fn gateway(mode: DispatchMode) -> TestGateway {
    gateway_with(MemorySftpServer::new(), |config| config.dispatch_mode = mode)
}

pub fn gateway_with(
    server: MemorySftpServer,
    customize: impl FnOnce(&mut GatewayConfig),
) -> TestGateway {
    let tmp = tempfile::tempdir().unwrap();
    let staging_dir = tmp.path().join("staging");

    let mut config = GatewayConfig {
        sftp_host: "memory".to_string(),
        sftp_user: "demo".to_string(),
        sftp_password: Some("demo".to_string()),
        local_temp_path: staging_dir.clone(),
        ..GatewayConfig::default()
    };
    customize(&mut config);

    let state = AppState::new(config, Arc::new(server.connector())).unwrap();
    TestGateway {
        app: create_app(state.clone()),
        state,
        server,
        staging_dir,
        _tmp: tmp,
    }
}

impl TestGateway {
    /// Files left in the staging directory.
    pub fn staged_files(&self) -> usize {
        match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    pub async fn send(&self, filename: &str, content: &str) -> (StatusCode, Value) {
        let body = serde_json::json!({ "filename": filename, "content": content });
        self.post_raw(body.to_string()).await
    }

    pub async fn post_raw(&self, body: String) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sftp/send")
                    .header("Content-Type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        read_json(response).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        read_json(response).await
    }
}

pub async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}
