use crate::api::error::AppError;
use crate::config::{DispatchMode, GatewayConfig};
use crate::models::{JobState, UploadJob, UploadResult};
use crate::services::session_pool::SessionPool;
use crate::services::sftp::{Credentials, SessionKey};
use crate::services::staging::StagedArtifact;
use crate::services::uploader::RemoteUploader;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs one upload end to end: lease, upload, release, local cleanup.
pub struct UploadExecutor {
    pool: Arc<SessionPool>,
    uploader: RemoteUploader,
    key: SessionKey,
    credentials: Credentials,
}

impl UploadExecutor {
    pub fn new(
        pool: Arc<SessionPool>,
        uploader: RemoteUploader,
        key: SessionKey,
        credentials: Credentials,
    ) -> Self {
        Self {
            pool,
            uploader,
            key,
            credentials,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    async fn transfer(&self, artifact: &StagedArtifact) -> Result<String, AppError> {
        let mut lease = self.pool.acquire(&self.key, &self.credentials).await?;
        let outcome = self.uploader.upload(&mut lease, artifact).await;
        self.pool.release(lease).await;
        outcome
    }

    /// Uploads and then removes the local copy. A cleanup failure is only
    /// logged; the upload outcome is what gets reported.
    pub async fn execute(&self, artifact: StagedArtifact) -> Result<String, AppError> {
        let outcome = self.transfer(&artifact).await;
        let _ = artifact.cleanup(outcome.is_ok()).await;
        outcome
    }
}

#[derive(Debug)]
pub enum Dispatched {
    /// Sync mode: the upload finished; carries the remote path.
    Completed(String),
    /// Async mode: the upload was queued under this job id.
    Queued(Uuid),
}

struct QueuedUpload {
    id: Uuid,
    artifact: StagedArtifact,
}

/// Hands staged artifacts to the uploader, either inline or through a
/// bounded queue served by a fixed number of concurrent workers.
pub struct Dispatcher {
    mode: DispatchMode,
    executor: Arc<UploadExecutor>,
    jobs: Arc<DashMap<Uuid, UploadJob>>,
    queue: Mutex<Option<mpsc::Sender<QueuedUpload>>>,
    queue_capacity: usize,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// In async mode this spawns the queue consumer, so it must be called
    /// from within a tokio runtime.
    pub fn new(config: &GatewayConfig, executor: Arc<UploadExecutor>) -> Self {
        let jobs = Arc::new(DashMap::new());
        let queue_capacity = config.queue_capacity.max(1);

        let (queue, consumer) = match config.dispatch_mode {
            DispatchMode::Sync => (None, None),
            DispatchMode::Async => {
                let (tx, rx) = mpsc::channel(queue_capacity);
                let handle = tokio::spawn(run_queue(
                    rx,
                    executor.clone(),
                    jobs.clone(),
                    config.worker_count.max(1),
                ));
                (Some(tx), Some(handle))
            }
        };

        Self {
            mode: config.dispatch_mode,
            executor,
            jobs,
            queue: Mutex::new(queue),
            queue_capacity,
            consumer: Mutex::new(consumer),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub async fn dispatch(&self, artifact: StagedArtifact) -> Result<Dispatched, AppError> {
        match self.mode {
            DispatchMode::Sync => self
                .executor
                .execute(artifact)
                .await
                .map(Dispatched::Completed),
            DispatchMode::Async => self.enqueue(artifact).await,
        }
    }

    async fn enqueue(&self, artifact: StagedArtifact) -> Result<Dispatched, AppError> {
        let id = Uuid::new_v4();
        let filename = artifact.remote_name().to_string();
        self.jobs.insert(id, UploadJob::queued(id, filename.clone()));

        let job = QueuedUpload { id, artifact };
        let rejected = {
            let queue = lock(&self.queue);
            match queue.as_ref() {
                Some(tx) => match tx.try_send(job) {
                    Ok(()) => None,
                    Err(TrySendError::Full(job)) => Some((
                        job,
                        AppError::QueueFull {
                            capacity: self.queue_capacity,
                        },
                    )),
                    Err(TrySendError::Closed(job)) => Some((
                        job,
                        AppError::Unavailable("upload queue is closed".to_string()),
                    )),
                },
                None => Some((
                    job,
                    AppError::Unavailable("upload queue is closed".to_string()),
                )),
            }
        };

        if let Some((job, err)) = rejected {
            self.jobs.remove(&id);
            let _ = job.artifact.cleanup(false).await;
            return Err(err);
        }

        info!("📥 Queued upload {} as job {}", filename, id);
        Ok(Dispatched::Queued(id))
    }

    pub fn job(&self, id: Uuid) -> Option<UploadJob> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    /// Jobs not yet in a terminal state.
    pub fn pending_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| !job.state.is_terminal())
            .count()
    }

    /// Forgets finished jobs older than `retention`.
    pub fn purge_jobs(&self, retention: Duration) -> usize {
        let before = self.jobs.len();
        let now = Utc::now();
        self.jobs.retain(|_, job| match job.finished_at {
            Some(finished) if job.state.is_terminal() => now
                .signed_duration_since(finished)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true),
            _ => true,
        });
        before.saturating_sub(self.jobs.len())
    }

    /// Stops accepting jobs and waits for queued and running ones to finish.
    pub async fn shutdown(&self) {
        drop(lock(&self.queue).take());
        let consumer = lock(&self.consumer).take();
        if let Some(handle) = consumer {
            info!("⏳ Draining upload queue ({} pending)", self.pending_jobs());
            if let Err(e) = handle.await {
                error!("Upload queue consumer failed: {}", e);
            }
        }
    }
}

async fn run_queue(
    mut rx: mpsc::Receiver<QueuedUpload>,
    executor: Arc<UploadExecutor>,
    jobs: Arc<DashMap<Uuid, UploadJob>>,
    workers: usize,
) {
    info!("🚀 Upload queue started ({} workers)", workers);
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let executor = executor.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(&executor, &jobs, job).await;
        });
    }

    // Every permit back means every spawned job has finished
    let _ = permits.acquire_many(workers as u32).await;
    info!("🛑 Upload queue drained");
}

async fn run_job(executor: &UploadExecutor, jobs: &DashMap<Uuid, UploadJob>, job: QueuedUpload) {
    let QueuedUpload { id, artifact } = job;
    if let Some(mut entry) = jobs.get_mut(&id) {
        entry.state = JobState::Running;
        entry.started_at = Some(Utc::now());
    }

    let outcome = executor.execute(artifact).await;
    let (state, result) = match &outcome {
        Ok(_) => (JobState::Succeeded, UploadResult::success()),
        Err(e) => {
            warn!("Job {} failed: {}: {}", id, e.kind(), e.details().join(": "));
            (JobState::Failed, e.to_result())
        }
    };

    if let Some(mut entry) = jobs.get_mut(&id) {
        entry.state = state;
        entry.finished_at = Some(Utc::now());
        entry.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::MemorySftpServer;
    use crate::services::session_pool::PoolConfig;
    use crate::services::staging::TempStaging;

    struct Fixture {
        server: MemorySftpServer,
        staging: TempStaging,
        config: GatewayConfig,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(mode: DispatchMode) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = GatewayConfig {
                dispatch_mode: mode,
                queue_capacity: 2,
                worker_count: 1,
                local_temp_path: dir.path().to_path_buf(),
                ..GatewayConfig::default()
            };
            Self {
                server: MemorySftpServer::new(),
                staging: TempStaging::new(dir.path()),
                config,
                _dir: dir,
            }
        }

        fn dispatcher(&self) -> Dispatcher {
            let pool = Arc::new(SessionPool::new(
                Arc::new(self.server.connector()),
                PoolConfig::from(&self.config),
            ));
            let executor = Arc::new(UploadExecutor::new(
                pool,
                RemoteUploader::new(&self.config),
                SessionKey::new("memory", 22, "demo"),
                Credentials::Password("demo".to_string()),
            ));
            Dispatcher::new(&self.config, executor)
        }

        fn staged_files(&self) -> usize {
            std::fs::read_dir(self.staging.root()).unwrap().count()
        }
    }

    #[tokio::test]
    async fn test_sync_dispatch_completes_and_cleans_up() {
        let f = Fixture::new(DispatchMode::Sync);
        let dispatcher = f.dispatcher();

        let artifact = f.staging.stage("a.txt", b"abc").await.unwrap();
        let outcome = dispatcher.dispatch(artifact).await.unwrap();

        assert!(matches!(outcome, Dispatched::Completed(ref path) if path == "upload/a.txt"));
        assert_eq!(f.server.file("upload/a.txt").unwrap(), b"abc");
        assert_eq!(f.staged_files(), 0);
    }

    #[tokio::test]
    async fn test_sync_failure_still_cleans_up() {
        let f = Fixture::new(DispatchMode::Sync);
        f.server.set_unreachable(true);
        let dispatcher = f.dispatcher();

        let artifact = f.staging.stage("a.txt", b"abc").await.unwrap();
        let err = dispatcher.dispatch(artifact).await.unwrap_err();

        assert!(matches!(err, AppError::Connection { .. }));
        assert_eq!(f.staged_files(), 0);
    }

    #[tokio::test]
    async fn test_async_dispatch_runs_job() {
        let f = Fixture::new(DispatchMode::Async);
        let dispatcher = f.dispatcher();

        let artifact = f.staging.stage("queued.txt", b"later").await.unwrap();
        let Dispatched::Queued(id) = dispatcher.dispatch(artifact).await.unwrap() else {
            panic!("expected a queued job");
        };

        dispatcher.shutdown().await;

        let job = dispatcher.job(id).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.result.unwrap().is_success());
        assert_eq!(f.server.file("upload/queued.txt").unwrap(), b"later");
        assert_eq!(f.staged_files(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast_and_cleans_up() {
        let f = Fixture::new(DispatchMode::Async);
        f.server.set_op_delay(Some(Duration::from_millis(50)));
        let dispatcher = f.dispatcher();

        let mut outcomes = Vec::new();
        for i in 0..6 {
            let artifact = f
                .staging
                .stage(&format!("f{}.txt", i), b"x")
                .await
                .unwrap();
            outcomes.push(dispatcher.dispatch(artifact).await);
        }

        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, Err(AppError::QueueFull { capacity: 2 })))
            .count();
        assert!(rejected >= 1);

        dispatcher.shutdown().await;
        assert_eq!(f.staged_files(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_refused() {
        let f = Fixture::new(DispatchMode::Async);
        let dispatcher = f.dispatcher();
        dispatcher.shutdown().await;

        let artifact = f.staging.stage("late.txt", b"x").await.unwrap();
        let err = dispatcher.dispatch(artifact).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
        assert_eq!(f.staged_files(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_and_pending_jobs() {
        let f = Fixture::new(DispatchMode::Async);
        let dispatcher = f.dispatcher();

        let artifact = f.staging.stage("a.txt", b"x").await.unwrap();
        let Dispatched::Queued(id) = dispatcher.dispatch(artifact).await.unwrap() else {
            panic!("expected a queued job");
        };
        dispatcher.shutdown().await;

        assert_eq!(dispatcher.purge_jobs(Duration::from_secs(3600)), 0);
        assert!(dispatcher.job(id).is_some());
        assert_eq!(dispatcher.purge_jobs(Duration::ZERO), 1);
        assert!(dispatcher.job(id).is_none());
    }
}
