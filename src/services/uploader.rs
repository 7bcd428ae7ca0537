use crate::api::error::AppError;
use crate::config::GatewayConfig;
use crate::services::session_pool::PooledSession;
use crate::services::sftp::{RemoteSession, SessionKey, TransportError};
use crate::services::staging::StagedArtifact;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress of one remote upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Open,
    WriteTemp,
    Finalize,
    Done,
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Open => "OPEN",
            UploadState::WriteTemp => "WRITE_TEMP",
            UploadState::Finalize => "FINALIZE",
            UploadState::Done => "DONE",
            UploadState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        if dir.starts_with('/') {
            format!("/{}", name)
        } else {
            name.to_string()
        }
    } else {
        format!("{}/{}", trimmed, name)
    }
}

/// Writes a staged file to the remote server so that the final name only
/// ever holds complete content: bytes go to `{name}{temp_suffix}` first and
/// are renamed into place once fully written.
#[derive(Debug, Clone)]
pub struct RemoteUploader {
    remote_path: String,
    auto_create_directory: bool,
    temp_suffix: String,
    chunk_size: usize,
    write_timeout: Duration,
}

impl RemoteUploader {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            remote_path: config.remote_path.clone(),
            auto_create_directory: config.auto_create_directory,
            temp_suffix: config.temp_suffix.clone(),
            chunk_size: config.chunk_size.max(1),
            write_timeout: config.write_timeout,
        }
    }

    /// Expands the configured directory template. Request data never
    /// contributes to the directory.
    pub fn resolve_directory(&self, now: DateTime<Utc>, key: &SessionKey) -> String {
        self.remote_path
            .replace("{date}", &now.format("%Y-%m-%d").to_string())
            .replace("{user}", &key.user)
            .replace("{host}", &key.host)
    }

    /// Uploads `artifact` over the leased session and returns the final
    /// remote path. Errors that leave the session unusable mark the lease
    /// broken so the pool discards it.
    pub async fn upload(
        &self,
        lease: &mut PooledSession,
        artifact: &StagedArtifact,
    ) -> Result<String, AppError> {
        let filename = artifact.remote_name();
        let dir = self.resolve_directory(Utc::now(), lease.key());
        let final_path = join_remote(&dir, filename);
        let temp_path = format!("{}{}", final_path, self.temp_suffix);

        let mut state = UploadState::Open;
        debug!("{}: {} ({} bytes to {})", filename, state, artifact.size(), lease.key());

        let outcome = self
            .run(lease, artifact, &dir, &temp_path, &final_path, &mut state)
            .await;

        match outcome {
            Ok(()) => {
                advance(&mut state, UploadState::Done, filename);
                lease.touch();
                info!(
                    "📤 Uploaded {} ({} bytes) to {}:{}",
                    filename,
                    artifact.size(),
                    lease.key(),
                    final_path
                );
                Ok(final_path)
            }
            Err(source) => {
                let failed_in = state;
                advance(&mut state, UploadState::Failed, filename);

                if matches!(failed_in, UploadState::WriteTemp | UploadState::Finalize) {
                    self.discard_temp(lease, &temp_path).await;
                }
                if source.breaks_session() {
                    lease.mark_broken();
                }

                Err(AppError::Transfer {
                    filename: filename.to_string(),
                    stage: failed_in,
                    source,
                })
            }
        }
    }

    async fn run(
        &self,
        lease: &PooledSession,
        artifact: &StagedArtifact,
        dir: &str,
        temp_path: &str,
        final_path: &str,
        state: &mut UploadState,
    ) -> Result<(), TransportError> {
        let remote = lease.remote()?;
        let filename = artifact.remote_name();

        if self.auto_create_directory {
            self.ensure_directory(remote, dir).await?;
        }

        advance(state, UploadState::WriteTemp, filename);
        self.write_temp(remote, artifact, temp_path).await?;

        advance(state, UploadState::Finalize, filename);
        self.finalize(remote, temp_path, final_path).await
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        timeout(self.write_timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout {
                op,
                after: self.write_timeout,
            })?
    }

    async fn ensure_directory(
        &self,
        remote: &dyn RemoteSession,
        dir: &str,
    ) -> Result<(), TransportError> {
        let mut current = if dir.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };

        for component in dir.split('/').filter(|c| !c.is_empty() && *c != ".") {
            current = join_remote(&current, component);
            if !self.timed("stat", remote.exists(&current)).await? {
                debug!("Creating remote directory {}", current);
                self.timed("mkdir", remote.create_dir(&current)).await?;
            }
        }
        Ok(())
    }

    async fn write_temp(
        &self,
        remote: &dyn RemoteSession,
        artifact: &StagedArtifact,
        temp_path: &str,
    ) -> Result<(), TransportError> {
        let mut local = tokio::fs::File::open(artifact.path())
            .await
            .map_err(TransportError::LocalRead)?;
        let mut remote_file = self.timed("create", remote.create(temp_path)).await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;
        loop {
            let n = local.read(&mut buf).await.map_err(TransportError::LocalRead)?;
            if n == 0 {
                break;
            }
            self.timed("write", async {
                remote_file.write_all(&buf[..n]).await.map_err(TransportError::Io)
            })
            .await?;
            written += n as u64;
        }

        self.timed("close", async {
            remote_file.shutdown().await.map_err(TransportError::Io)
        })
        .await?;
        drop(remote_file);

        if written != artifact.size() {
            return Err(TransportError::ShortWrite {
                written,
                expected: artifact.size(),
            });
        }
        Ok(())
    }

    /// Renames the temp file into place. Servers that refuse to overwrite
    /// get the existing file moved to a backup name and the rename retried
    /// once. The backup is restored if the retry fails, so a failed upload
    /// never loses the previous file.
    async fn finalize(
        &self,
        remote: &dyn RemoteSession,
        temp_path: &str,
        final_path: &str,
    ) -> Result<(), TransportError> {
        let first = match self.timed("rename", remote.rename(temp_path, final_path)).await {
            Ok(()) => return Ok(()),
            Err(e @ TransportError::Sftp { .. }) => e,
            Err(e) => return Err(e),
        };
        if !self.timed("stat", remote.exists(final_path)).await? {
            return Err(first);
        }

        let backup_path = format!("{}.{}.bak", final_path, Uuid::new_v4());
        debug!("Replacing existing remote file {} (backup {})", final_path, backup_path);
        self.timed("rename", remote.rename(final_path, &backup_path))
            .await?;

        match self.timed("rename", remote.rename(temp_path, final_path)).await {
            Ok(()) => {
                if let Err(e) = self.timed("remove", remote.remove(&backup_path)).await {
                    warn!("Could not remove remote backup {}: {}", backup_path, e);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self
                    .timed("rename", remote.rename(&backup_path, final_path))
                    .await
                {
                    warn!(
                        "Could not restore {} from backup {}: {}",
                        final_path, backup_path, restore
                    );
                }
                Err(e)
            }
        }
    }

    async fn discard_temp(&self, lease: &PooledSession, temp_path: &str) {
        let removed = match lease.remote() {
            Ok(remote) => self.timed("remove", remote.remove(temp_path)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!("Could not remove remote temp file {}: {}", temp_path, e);
        }
    }
}

fn advance(state: &mut UploadState, next: UploadState, filename: &str) {
    debug!("{}: {} -> {}", filename, state, next);
    *state = next;
}
