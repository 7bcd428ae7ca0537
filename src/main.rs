use clap::Parser;
use dotenvy::dotenv;
use sftp_gateway::config::{GatewayConfig, HostKeyPolicy};
use sftp_gateway::services::memory::MemorySftpServer;
use sftp_gateway::services::sftp::{RusshConnector, SftpConnector};
use sftp_gateway::services::worker::BackgroundWorker;
use sftp_gateway::{AppState, create_app};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Use the development defaults instead of the environment
    #[arg(long)]
    development: bool,

    /// Deliver into an in-process SFTP store instead of a real server
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment & logging
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sftp_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting SFTP Gateway...");

    // 2. Configuration
    let mut config = if args.development {
        GatewayConfig::development()
    } else {
        GatewayConfig::from_env()
    };
    if args.dry_run {
        config.auto_create_directory = true;
        if config.sftp_password.is_none() && config.sftp_private_key.is_none() {
            config.sftp_password = Some("dry-run".to_string());
        }
    }

    info!(
        "🛡️  SFTP target: {}@{}:{}, remote path '{}', dispatch {}, pool capacity {}/key",
        config.sftp_user,
        config.sftp_host,
        config.sftp_port,
        config.remote_path,
        config.dispatch_mode.as_str(),
        config.pool_capacity_per_key
    );
    match &config.host_key_policy {
        HostKeyPolicy::AcceptAny => {
            warn!("⚠️  SFTP_HOST_KEY_POLICY=accept-any: server host keys are NOT verified")
        }
        HostKeyPolicy::RejectAll if !args.dry_run => warn!(
            "⚠️  SFTP_HOST_KEY_POLICY is not set: every host key will be rejected"
        ),
        policy => info!("🔑 Host key policy: {}", policy.describe()),
    }

    // 3. Transport & pipeline
    let connector: Arc<dyn SftpConnector> = if args.dry_run {
        info!("🧪 Dry run: uploads go to an in-memory SFTP store");
        Arc::new(MemorySftpServer::new().connector())
    } else {
        Arc::new(RusshConnector::new(config.host_key_policy.clone()))
    };

    let state = AppState::new(config, connector)?;

    // 4. Shutdown channel & background worker
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = BackgroundWorker::new(
        state.pool.clone(),
        state.transfer_service.staging().clone(),
        state.dispatcher.clone(),
        &state.config,
        shutdown_rx,
    );
    let worker_handle = tokio::spawn(worker.run());
    info!("👷 Background worker initialized.");

    // 5. HTTP server
    let app = create_app(state.clone()).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");

                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            ),
    );

    let addr = SocketAddr::new(args.bind, args.port);
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // 6. Drain
    if let Err(e) = worker_handle.await {
        error!("Background worker task failed: {}", e);
    }
    state.shutdown().await;

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
