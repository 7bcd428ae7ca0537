use crate::config::{GatewayConfig, HostKeyPolicy};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::SftpSession;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// Identity of a remote endpoint/credential pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.sftp_host, config.sftp_port, &config.sftp_user)
    }

    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Clone)]
pub enum Credentials {
    Password(String),
    /// Path to a key file or inline PEM material.
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl Credentials {
    /// Private key wins over password when both are configured.
    pub fn from_config(config: &GatewayConfig) -> Option<Self> {
        if let Some(key) = &config.sftp_private_key {
            return Some(Self::PrivateKey {
                key: key.clone(),
                passphrase: config.sftp_private_key_passphrase.clone(),
            });
        }
        config.sftp_password.clone().map(Self::Password)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "publickey",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({}, <redacted>)", self.method())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("credentials rejected for user '{user}' ({method})")]
    AuthRejected { user: String, method: &'static str },

    #[error("private key could not be loaded: {0}")]
    Key(String),

    #[error("ssh protocol error: {0}")]
    Protocol(String),

    #[error("sftp {op} on '{path}' failed: {reason}")]
    Sftp {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("reading staged file failed: {0}")]
    LocalRead(#[source] std::io::Error),

    #[error("short write: {written} of {expected} bytes reached the remote file")]
    ShortWrite { written: u64, expected: u64 },

    #[error("session is closed")]
    Closed,

    #[error("session pool is shut down")]
    PoolShutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the session that produced this error must not be reused.
    /// SFTP status replies leave the session usable; everything else may
    /// have left a request in flight.
    pub fn breaks_session(&self) -> bool {
        !matches!(
            self,
            TransportError::Sftp { .. } | TransportError::LocalRead(_) | TransportError::ShortWrite { .. }
        )
    }

    fn sftp(op: &'static str, path: &str, err: impl fmt::Display) -> Self {
        TransportError::Sftp {
            op,
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens transports to a remote endpoint.
#[async_trait]
pub trait SftpConnector: Send + Sync {
    /// TCP connect, SSH handshake and host key verification.
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn PendingSession>, TransportError>;
}

/// A connected but not yet authenticated transport.
#[async_trait]
pub trait PendingSession: Send {
    /// Returns `Ok(false)` when the server rejects the credentials.
    async fn authenticate(
        &mut self,
        user: &str,
        credentials: &Credentials,
    ) -> Result<bool, TransportError>;

    /// Starts the sftp subsystem on an authenticated transport.
    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// A live SFTP session. Callers must never issue operations on one session
/// from two uploads at once; the pool hands each session to a single lease.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Lightweight round-trip confirming the session is usable.
    async fn probe(&self) -> Result<(), TransportError>;
    async fn create(&self, path: &str) -> Result<RemoteWriter, TransportError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;
    async fn remove(&self, path: &str) -> Result<(), TransportError>;
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;
    async fn create_dir(&self, path: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

pub struct ClientHandler {
    endpoint: String,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let accepted = self.policy.accepts(&fingerprint);

        match &self.policy {
            HostKeyPolicy::AcceptAny => tracing::warn!(
                "⚠️  Accepting unverified host key SHA256:{} for {} (policy: accept-any)",
                fingerprint,
                self.endpoint
            ),
            _ if accepted => {
                tracing::debug!("Host key SHA256:{} for {} verified", fingerprint, self.endpoint)
            }
            _ => tracing::error!(
                "❌ Host key SHA256:{} for {} rejected by policy {}",
                fingerprint,
                self.endpoint,
                self.policy.describe()
            ),
        }

        Ok(accepted)
    }
}

/// Production connector backed by russh.
pub struct RusshConnector {
    policy: HostKeyPolicy,
    ssh_config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            ssh_config: Arc::new(client::Config::default()),
        }
    }
}

#[async_trait]
impl SftpConnector for RusshConnector {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn PendingSession>, TransportError> {
        let endpoint = key.endpoint();
        let handler = ClientHandler {
            endpoint: endpoint.clone(),
            policy: self.policy.clone(),
        };

        let handle = client::connect(
            self.ssh_config.clone(),
            (key.host.as_str(), key.port),
            handler,
        )
        .await
        .map_err(|e| {
            let reason = match e {
                russh::Error::UnknownKey => {
                    format!("host key rejected by policy {}", self.policy.describe())
                }
                other => other.to_string(),
            };
            TransportError::Connect {
                endpoint: endpoint.clone(),
                reason,
            }
        })?;

        Ok(Box::new(RusshPending {
            handle: Some(handle),
        }))
    }
}

struct RusshPending {
    handle: Option<Handle<ClientHandler>>,
}

#[async_trait]
impl PendingSession for RusshPending {
    async fn authenticate(
        &mut self,
        user: &str,
        credentials: &Credentials,
    ) -> Result<bool, TransportError> {
        let handle = self.handle.as_mut().ok_or(TransportError::Closed)?;

        let accepted = match credentials {
            Credentials::Password(password) => {
                handle.authenticate_password(user, password.as_str()).await
            }
            Credentials::PrivateKey { key, passphrase } => {
                let pair = load_key_pair(key, passphrase.as_deref())?;
                handle.authenticate_publickey(user, Arc::new(pair)).await
            }
        }
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

        Ok(accepted)
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let handle = self.handle.take().ok_or(TransportError::Closed)?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Protocol(format!("failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| TransportError::Protocol(format!("sftp subsystem refused: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Protocol(format!("sftp init failed: {}", e)))?;

        Ok(Box::new(RusshSession {
            handle: Mutex::new(handle),
            sftp,
        }))
    }
}

fn load_key_pair(material: &str, passphrase: Option<&str>) -> Result<KeyPair, TransportError> {
    let loaded = if material.contains("-----BEGIN") {
        russh_keys::decode_secret_key(material, passphrase)
    } else {
        russh_keys::load_secret_key(material, passphrase)
    };
    loaded.map_err(|e| TransportError::Key(e.to_string()))
}

struct RusshSession {
    handle: Mutex<Handle<ClientHandler>>,
    sftp: SftpSession,
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn probe(&self) -> Result<(), TransportError> {
        self.sftp
            .canonicalize(".")
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Protocol(format!("liveness probe failed: {}", e)))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, TransportError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| TransportError::sftp("create", path, e))?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| TransportError::sftp("rename", from, e))
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| TransportError::sftp("remove", path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        self.sftp
            .try_exists(path)
            .await
            .map_err(|e| TransportError::sftp("stat", path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| TransportError::sftp("mkdir", path, e))
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            tracing::debug!("sftp close failed: {}", e);
        }
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("ssh disconnect failed: {}", e);
        }
    }
}
