//! In-process SFTP backend.
//!
//! Behaves like a strict SFTPv3 server (rename refuses to overwrite, writes
//! need an existing parent directory) and records what happened to it:
//! connection count, closed sessions and any overlapping use of a single
//! session. Used by `--dry-run` and by the test suites.

use crate::services::sftp::{
    Credentials, PendingSession, RemoteSession, RemoteWriter, SessionKey, SftpConnector,
    TransportError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

#[derive(Debug, Default, Clone)]
struct Faults {
    unreachable: bool,
    connect_delay: Option<Duration>,
    auth_delay: Option<Duration>,
    op_delay: Option<Duration>,
    fail_write_after: Option<usize>,
    stall_writes: bool,
    fail_rename: bool,
    fail_rename_from: Option<String>,
}

#[derive(Default)]
struct ServerState {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    password: Option<String>,
    faults: Mutex<Faults>,
    connections: AtomicUsize,
    closed_sessions: AtomicUsize,
    interleavings: AtomicUsize,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Shared handle to the in-memory server; clones see the same files.
#[derive(Clone)]
pub struct MemorySftpServer {
    state: Arc<ServerState>,
}

impl Default for MemorySftpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySftpServer {
    /// A server with an `upload` directory that accepts any credentials.
    pub fn new() -> Self {
        let server = Self {
            state: Arc::new(ServerState::default()),
        };
        server.add_dir("upload");
        server
    }

    /// Only this password (or any private key) authenticates.
    pub fn with_password(password: impl Into<String>) -> Self {
        let server = Self {
            state: Arc::new(ServerState {
                password: Some(password.into()),
                ..ServerState::default()
            }),
        };
        server.add_dir("upload");
        server
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    pub fn add_dir(&self, dir: &str) {
        lock(&self.state.dirs).insert(dir.trim_end_matches('/').to_string());
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        dir.is_empty() || dir == "." || lock(&self.state.dirs).contains(dir)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state.files).get(path).cloned()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        lock(&self.state.files).insert(path.to_string(), content.to_vec());
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.state.files).keys().cloned().collect()
    }

    /// Number of transports opened so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.closed_sessions.load(Ordering::SeqCst)
    }

    /// Operations issued on a session while another one was still running on it.
    pub fn interleavings(&self) -> usize {
        self.state.interleavings.load(Ordering::SeqCst)
    }

    /// Drops every open session server-side; their next operation fails.
    pub fn kill_sessions(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state.faults).unreachable = unreachable;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        lock(&self.state.faults).connect_delay = delay;
    }

    pub fn set_auth_delay(&self, delay: Option<Duration>) {
        lock(&self.state.faults).auth_delay = delay;
    }

    /// Delay applied inside every session operation.
    pub fn set_op_delay(&self, delay: Option<Duration>) {
        lock(&self.state.faults).op_delay = delay;
    }

    /// Writes fail once a remote file would grow past `limit` bytes.
    pub fn set_fail_write_after(&self, limit: Option<usize>) {
        lock(&self.state.faults).fail_write_after = limit;
    }

    /// Writes never complete.
    pub fn set_stall_writes(&self, stall: bool) {
        lock(&self.state.faults).stall_writes = stall;
    }

    pub fn set_fail_rename(&self, fail: bool) {
        lock(&self.state.faults).fail_rename = fail;
    }

    /// Only renames whose source is `path` fail.
    pub fn set_fail_rename_from(&self, path: Option<&str>) {
        lock(&self.state.faults).fail_rename_from = path.map(str::to_string);
    }

    fn faults(&self) -> Faults {
        lock(&self.state.faults).clone()
    }
}

pub struct MemoryConnector {
    server: MemorySftpServer,
}

#[async_trait]
impl SftpConnector for MemoryConnector {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn PendingSession>, TransportError> {
        let faults = self.server.faults();
        if let Some(delay) = faults.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.unreachable {
            return Err(TransportError::Connect {
                endpoint: key.endpoint(),
                reason: "Connection refused (os error 111)".to_string(),
            });
        }

        self.server.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryPending {
            server: self.server.clone(),
            authenticated: false,
        }))
    }
}

struct MemoryPending {
    server: MemorySftpServer,
    authenticated: bool,
}

#[async_trait]
impl PendingSession for MemoryPending {
    async fn authenticate(
        &mut self,
        _user: &str,
        credentials: &Credentials,
    ) -> Result<bool, TransportError> {
        if let Some(delay) = self.server.faults().auth_delay {
            tokio::time::sleep(delay).await;
        }
        self.authenticated = match (&self.server.state.password, credentials) {
            (None, _) => true,
            (Some(expected), Credentials::Password(given)) => expected == given,
            (Some(_), Credentials::PrivateKey { .. }) => true,
        };
        Ok(self.authenticated)
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteSession>, TransportError> {
        if !self.authenticated {
            return Err(TransportError::Protocol("not authenticated".to_string()));
        }
        Ok(Box::new(MemorySession {
            server: self.server.clone(),
            generation: self.server.state.generation.load(Ordering::SeqCst),
            in_flight: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Marks a session busy; overlapping guards count as an interleaving.
struct OpGuard {
    in_flight: Arc<AtomicUsize>,
}

impl OpGuard {
    fn enter(in_flight: &Arc<AtomicUsize>, state: &ServerState) -> Self {
        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            state.interleavings.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            in_flight: in_flight.clone(),
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySession {
    server: MemorySftpServer,
    generation: u64,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemorySession {
    async fn begin(&self) -> Result<OpGuard, TransportError> {
        if self.closed.load(Ordering::SeqCst)
            || self.server.state.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(TransportError::Closed);
        }
        let guard = OpGuard::enter(&self.in_flight, &self.server.state);
        if let Some(delay) = self.server.faults().op_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(guard)
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        lock(&self.server.state.files)
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn probe(&self) -> Result<(), TransportError> {
        self.begin().await.map(|_| ())
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, TransportError> {
        let guard = self.begin().await?;
        if !self.server.has_dir(parent_dir(path)) {
            return Err(TransportError::Sftp {
                op: "create",
                path: path.to_string(),
                reason: "No such file".to_string(),
            });
        }
        self.files().insert(path.to_string(), Vec::new());
        Ok(Box::new(MemoryWriter {
            server: self.server.clone(),
            path: path.to_string(),
            written: 0,
            _guard: guard,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let _guard = self.begin().await?;
        let failure = |reason: &str| TransportError::Sftp {
            op: "rename",
            path: from.to_string(),
            reason: reason.to_string(),
        };

        let faults = self.server.faults();
        if faults.fail_rename || faults.fail_rename_from.as_deref() == Some(from) {
            return Err(failure("Failure"));
        }

        let mut files = self.files();
        if files.contains_key(to) {
            return Err(failure("Failure"));
        }
        let content = files.remove(from).ok_or_else(|| failure("No such file"))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        let _guard = self.begin().await?;
        match self.files().remove(path) {
            Some(_) => Ok(()),
            None => Err(TransportError::Sftp {
                op: "remove",
                path: path.to_string(),
                reason: "No such file".to_string(),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        let _guard = self.begin().await?;
        Ok(self.files().contains_key(path) || self.server.has_dir(path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        let _guard = self.begin().await?;
        if !self.server.has_dir(parent_dir(path)) {
            return Err(TransportError::Sftp {
                op: "mkdir",
                path: path.to_string(),
                reason: "No such file".to_string(),
            });
        }
        self.server.add_dir(path);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.state.closed_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MemoryWriter {
    server: MemorySftpServer,
    path: String,
    written: usize,
    _guard: OpGuard,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let faults = this.server.faults();

        if faults.stall_writes {
            return Poll::Pending;
        }
        if let Some(limit) = faults.fail_write_after {
            if this.written + buf.len() > limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection reset during write",
                )));
            }
        }

        lock(&this.server.state.files)
            .entry(this.path.clone())
            .or_default()
            .extend_from_slice(buf);
        this.written += buf.len();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
