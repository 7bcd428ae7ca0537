mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{gateway, gateway_with, read_json};
use sftp_gateway::config::DispatchMode;
use sftp_gateway::services::memory::MemorySftpServer;
use std::time::Duration;
use tokio::time::timeout;
use tower::ServiceExt;

#[tokio::test]
async fn test_send_delivers_file() {
    let gw = gateway(DispatchMode::Sync);

    let (status, json) = gw.send("report.csv", "aGVsbG8=").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
    assert!(json["timestamp"].is_string());
    assert!(json.get("errors").is_none());
    assert_eq!(gw.server.file("upload/report.csv").unwrap(), b"hello");
    assert!(gw.server.file("upload/report.csv.tmp").is_none());
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_empty_content_creates_empty_file() {
    let gw = gateway(DispatchMode::Sync);

    let (status, _) = gw.send("empty.txt", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.server.file("upload/empty.txt").unwrap(), b"");
}

#[tokio::test]
async fn test_invalid_base64_is_rejected_without_side_effects() {
    let gw = gateway(DispatchMode::Sync);

    let (status, json) = gw.send("report.csv", "not-valid-base64!!").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], "failure");
    assert_eq!(json["message"], "Send file by SFTP failed.");
    assert!(json["errors"][0].as_str().unwrap().contains("base64"));
    assert_eq!(gw.staged_files(), 0);
    assert!(gw.server.paths().is_empty());
    assert_eq!(gw.server.connections(), 0);
}

#[tokio::test]
async fn test_unreachable_host_reports_connection_failure() {
    let server = MemorySftpServer::new();
    server.set_unreachable(true);
    let gw = gateway_with(server, |_| {});

    let (status, json) = gw.send("report.csv", "aGVsbG8=").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["status"], "failure");
    let errors = json["errors"].as_array().unwrap();
    assert!(
        errors
            .iter()
            .any(|e| e.as_str().unwrap().to_lowercase().contains("connect"))
    );
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_wrong_password_reports_auth_failure() {
    let gw = gateway_with(MemorySftpServer::with_password("s3cret"), |_| {});

    let (status, json) = gw.send("report.csv", "aGVsbG8=").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(
        json["errors"][0]
            .as_str()
            .unwrap()
            .starts_with("Authentication failed")
    );
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_path_traversal_rejected_before_io() {
    let gw = gateway(DispatchMode::Sync);

    for name in ["../../etc/passwd", "a/b.txt", "..", "dir\\file.txt"] {
        let (status, json) = gw.send(name, "aGVsbG8=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} should be rejected", name);
        assert_eq!(json["status"], "failure");
    }

    assert!(!gw.staging_dir.exists());
    assert_eq!(gw.server.connections(), 0);
}

#[tokio::test]
async fn test_transfer_failure_leaves_no_partial_file() {
    let server = MemorySftpServer::new();
    server.set_fail_write_after(Some(3));
    let gw = gateway_with(server, |config| config.chunk_size = 2);

    let (status, json) = gw.send("big.bin", "aGVsbG8gd29ybGQ=").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["errors"][0].as_str().unwrap().contains("WRITE_TEMP"));
    assert!(gw.server.paths().is_empty());
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_cancelled_request_cleans_up_staged_file() {
    let server = MemorySftpServer::new();
    server.set_op_delay(Some(Duration::from_millis(200)));
    let gw = gateway_with(server, |_| {});

    let cancelled = timeout(Duration::from_millis(50), gw.send("report.csv", "aGVsbG8=")).await;
    assert!(cancelled.is_err());

    assert_eq!(gw.staged_files(), 0);
    assert!(gw.server.file("upload/report.csv").is_none());
    assert_eq!(gw.state.pool.stats().checked_out, 0);

    gw.server.set_op_delay(None);
    let (status, _) = gw.send("report.csv", "aGVsbG8=").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.server.file("upload/report.csv").unwrap(), b"hello");
}

#[tokio::test]
async fn test_failed_replace_keeps_previous_file() {
    let server = MemorySftpServer::new();
    server.put_file("upload/report.csv", b"previous good content");
    server.set_fail_rename(true);
    let gw = gateway_with(server, |_| {});

    let (status, json) = gw.send("report.csv", "aGVsbG8=").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["errors"][0].as_str().unwrap().contains("FINALIZE"));
    assert_eq!(
        gw.server.file("upload/report.csv").unwrap(),
        b"previous good content"
    );
    assert_eq!(gw.server.paths(), vec!["upload/report.csv".to_string()]);
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_existing_remote_file_is_replaced() {
    let server = MemorySftpServer::new();
    server.put_file("upload/report.csv", b"stale");
    let gw = gateway_with(server, |_| {});

    let (status, _) = gw.send("report.csv", "aGVsbG8=").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.server.file("upload/report.csv").unwrap(), b"hello");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let gw = gateway(DispatchMode::Sync);

    let (status, json) = gw.post_raw("{ not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], "failure");

    let (status, _) = gw.post_raw(r#"{"filename": "a.txt"}"#.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_body_is_refused() {
    let gw = gateway_with(MemorySftpServer::new(), |config| {
        config.max_payload_size = 64
    });

    let content = "A".repeat(200);
    let (status, json) = gw.send("big.txt", &content).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["status"], "failure");
    assert_eq!(gw.staged_files(), 0);
}

#[tokio::test]
async fn test_request_id_is_echoed_or_generated() {
    let gw = gateway(DispatchMode::Sync);

    let response = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-123");

    let response = gw
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let generated = response.headers()["x-request-id"].to_str().unwrap();
    assert_eq!(generated.len(), 36);
}

#[tokio::test]
async fn test_health_reports_pool_state() {
    let gw = gateway(DispatchMode::Sync);
    gw.send("a.txt", "YQ==").await;

    let (status, json) = gw.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["dispatch_mode"], "sync");
    assert_eq!(json["pool"]["connections_established"], 1);
    assert_eq!(json["pool"]["cached_sessions"], 1);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let gw = gateway(DispatchMode::Sync);

    let response = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, json) = read_json(response).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["paths"]["/sftp/send"].is_object());
}
