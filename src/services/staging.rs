use crate::api::error::AppError;
use crate::utils::validation::validate_filename;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Longest slice of the requested name kept in the local file name.
const LOCAL_NAME_HINT_LEN: usize = 96;

/// A staged file could not be removed. Logged, never reported as the failure.
#[derive(Error, Debug)]
#[error("could not remove staged file {}: {source}", .path.display())]
pub struct CleanupWarning {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Writes request payloads into a local work directory.
#[derive(Debug, Clone)]
pub struct TempStaging {
    root: PathBuf,
}

impl TempStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materializes `bytes` under a collision-safe local name. The returned
    /// artifact removes the file when cleaned up or dropped.
    pub async fn stage(&self, filename: &str, bytes: &[u8]) -> Result<StagedArtifact, AppError> {
        let filename = validate_filename(filename)?;
        let staging_error = |source: std::io::Error| AppError::StagingIo {
            filename: filename.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(staging_error)?;

        let path = self.root.join(local_name(filename));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(staging_error)?;

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(source) = written {
            // Partial content must not survive
            let _ = tokio::fs::remove_file(&path).await;
            return Err(staging_error(source));
        }

        tracing::debug!(
            "Staged {} ({} bytes) at {}",
            filename,
            bytes.len(),
            path.display()
        );

        Ok(StagedArtifact {
            path,
            remote_name: filename.to_string(),
            size: bytes.len() as u64,
            released: false,
        })
    }

    /// Removes staged files older than `max_age`, left behind by a crash.
    pub async fn sweep_stale(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();

            if age > max_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(
                        "Failed to sweep stale staging file {}: {}",
                        entry.path().display(),
                        e
                    ),
                }
            }
        }

        Ok(removed)
    }
}

fn local_name(filename: &str) -> String {
    let mut end = filename.len().min(LOCAL_NAME_HINT_LEN);
    while !filename.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-{}", Uuid::new_v4().simple(), &filename[..end])
}

/// A request's local copy of the payload. Exclusively owned by one request.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    remote_name: String,
    size: u64,
    released: bool,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The basename the file must carry on the remote side.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Removes the local file. Consuming `self` makes this run at most once;
    /// the `Drop` impl covers paths that never reach it.
    pub async fn cleanup(mut self, succeeded: bool) -> Result<(), CleanupWarning> {
        self.released = true;
        let outcome = if succeeded { "succeeded" } else { "failed" };

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(
                    "🧹 Removed staged file {} (upload {})",
                    self.path.display(),
                    outcome
                );
                Ok(())
            }
            Err(source) => {
                let warning = CleanupWarning {
                    path: self.path.clone(),
                    source,
                };
                tracing::warn!("CleanupWarning: {} (upload {})", warning, outcome);
                Err(warning)
            }
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(
                "🧹 Removed abandoned staged file {}",
                self.path.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "CleanupWarning: could not remove staged file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_writes_full_content() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path().join("work"));

        let artifact = staging.stage("report.csv", b"hello").await.unwrap();
        assert_eq!(artifact.remote_name(), "report.csv");
        assert_eq!(artifact.size(), 5);
        assert!(artifact.path().starts_with(staging.root()));
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_same_filename_gets_distinct_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let (a, b) = tokio::join!(
            staging.stage("same.txt", b"first"),
            staging.stage("same.txt", b"second")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.path(), b.path());
        assert_eq!(std::fs::read(a.path()).unwrap(), b"first");
        assert_eq!(std::fs::read(b.path()).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_invalid_filename_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("never-created");
        let staging = TempStaging::new(&root);

        let err = staging.stage("../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidFilename(_)));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let artifact = staging.stage("a.bin", &[1, 2, 3]).await.unwrap();
        let path = artifact.path().to_path_buf();
        artifact.cleanup(true).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_of_missing_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let artifact = staging.stage("gone.txt", b"x").await.unwrap();
        std::fs::remove_file(artifact.path()).unwrap();
        let warning = artifact.cleanup(false).await.unwrap_err();
        assert_eq!(warning.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let artifact = staging.stage("dropped.txt", b"x").await.unwrap();
        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_long_names_fit_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let name = "é".repeat(127);
        let artifact = staging.stage(&name, b"x").await.unwrap();
        assert_eq!(artifact.remote_name(), name);
        assert!(artifact.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let dir = tempfile::tempdir().unwrap();
        let staging = TempStaging::new(dir.path());

        let artifact = staging.stage("fresh.txt", b"x").await.unwrap();
        assert_eq!(staging.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(artifact.path().exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(staging.sweep_stale(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(!artifact.path().exists());

        let missing = TempStaging::new(dir.path().join("missing"));
        assert_eq!(missing.sweep_stale(Duration::ZERO).await.unwrap(), 0);
    }
}
