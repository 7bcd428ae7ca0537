use crate::config::GatewayConfig;
use crate::services::dispatcher::Dispatcher;
use crate::services::session_pool::SessionPool;
use crate::services::staging::TempStaging;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodic housekeeping: idle session eviction, stale staging files and
/// finished job records.
pub struct BackgroundWorker {
    pool: Arc<SessionPool>,
    staging: TempStaging,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    staging_max_age: Duration,
    job_retention: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        pool: Arc<SessionPool>,
        staging: TempStaging,
        dispatcher: Arc<Dispatcher>,
        config: &GatewayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            staging,
            dispatcher,
            interval: config.maintenance_interval,
            staging_max_age: config.staging_cleanup_age(),
            job_retention: config.job_retention,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_maintenance().await;
                }
            }
        }
    }

    pub async fn perform_maintenance(&self) {
        tracing::debug!("🧹 Running maintenance pass");

        // 1. Idle sessions
        let evicted = self.pool.evict_idle().await;

        // 2. Staging files left behind by a crash
        let swept = match self.staging.sweep_stale(self.staging_max_age).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(
                    "Failed to sweep staging directory {}: {}",
                    self.staging.root().display(),
                    e
                );
                0
            }
        };

        // 3. Finished jobs
        let purged = self.dispatcher.purge_jobs(self.job_retention);

        if evicted + swept + purged > 0 {
            tracing::info!(
                "✅ Maintenance: {} idle sessions closed, {} stale staging files removed, {} jobs purged",
                evicted,
                swept,
                purged
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dispatcher::UploadExecutor;
    use crate::services::memory::MemorySftpServer;
    use crate::services::session_pool::PoolConfig;
    use crate::services::sftp::{Credentials, SessionKey};
    use crate::services::uploader::RemoteUploader;

    #[tokio::test]
    async fn test_maintenance_evicts_and_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            session_idle_timeout: Duration::ZERO,
            staging_cleanup_age_hours: 0,
            ..GatewayConfig::default()
        };
        let server = MemorySftpServer::new();
        let pool = Arc::new(SessionPool::new(
            Arc::new(server.connector()),
            PoolConfig::from(&config),
        ));
        let key = SessionKey::new("memory", 22, "demo");
        let creds = Credentials::Password("demo".to_string());
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::new(UploadExecutor::new(
                pool.clone(),
                RemoteUploader::new(&config),
                key.clone(),
                creds.clone(),
            )),
        ));
        let staging = TempStaging::new(dir.path());

        let lease = pool.acquire(&key, &creds).await.unwrap();
        pool.release(lease).await;
        let orphan = staging.stage("orphan.txt", b"x").await.unwrap();
        let orphan_path = orphan.path().to_path_buf();
        std::mem::forget(orphan);
        sleep(Duration::from_millis(20)).await;

        let (_tx, rx) = watch::channel(false);
        let worker = BackgroundWorker::new(pool.clone(), staging, dispatcher, &config, rx);
        worker.perform_maintenance().await;

        assert_eq!(pool.stats().cached_sessions, 0);
        assert!(!orphan_path.exists());
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::default();
        let server = MemorySftpServer::new();
        let pool = Arc::new(SessionPool::new(
            Arc::new(server.connector()),
            PoolConfig::from(&config),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::new(UploadExecutor::new(
                pool.clone(),
                RemoteUploader::new(&config),
                SessionKey::new("memory", 22, "demo"),
                Credentials::Password("demo".to_string()),
            )),
        ));

        let (tx, rx) = watch::channel(false);
        let worker = BackgroundWorker::new(pool, TempStaging::new(dir.path()), dispatcher, &config, rx);
        let handle = tokio::spawn(worker.run());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
