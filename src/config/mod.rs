use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How accepted requests reach the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The request waits until the upload reaches a terminal state.
    Sync,
    /// The request is queued for the worker set and answered with a job id.
    Async,
}

impl DispatchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Some(Self::Sync),
            "async" | "asynchronous" | "queue" => Some(Self::Async),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Server host key verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Every host key is rejected. Used when no policy was configured.
    RejectAll,
    /// Any host key is accepted. Must be chosen explicitly.
    AcceptAny,
    /// Only keys whose SHA-256 fingerprint is listed are accepted.
    Fingerprints(Vec<String>),
}

impl HostKeyPolicy {
    /// Parses `accept-any`, `reject-all` or a comma separated list of
    /// fingerprints (`SHA256:` prefix optional).
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.to_lowercase().as_str() {
            "" | "reject-all" | "reject" => Self::RejectAll,
            "accept-any" | "accept_any" | "insecure" => Self::AcceptAny,
            _ => Self::Fingerprints(
                value
                    .split(',')
                    .map(normalize_fingerprint)
                    .filter(|f| !f.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn accepts(&self, fingerprint: &str) -> bool {
        match self {
            Self::RejectAll => false,
            Self::AcceptAny => true,
            Self::Fingerprints(allowed) => {
                let fingerprint = normalize_fingerprint(fingerprint);
                allowed.iter().any(|f| *f == fingerprint)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::RejectAll => "reject-all (SFTP_HOST_KEY_POLICY not set)".to_string(),
            Self::AcceptAny => "accept-any".to_string(),
            Self::Fingerprints(f) => format!("{} pinned fingerprint(s)", f.len()),
        }
    }
}

fn normalize_fingerprint(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix("SHA256:")
        .unwrap_or(value)
        .trim_end_matches('=')
        .to_string()
}

/// Gateway configuration: remote endpoint, credentials, staging and dispatch.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Remote SFTP host (default: "127.0.0.1")
    pub sftp_host: String,

    /// Remote SFTP port (default: 22)
    pub sftp_port: u16,

    /// Remote SFTP user
    pub sftp_user: String,

    /// Password credential
    pub sftp_password: Option<String>,

    /// Private key credential: a path or inline PEM material
    pub sftp_private_key: Option<String>,

    /// Passphrase for an encrypted private key
    pub sftp_private_key_passphrase: Option<String>,

    /// Remote directory template. Supports `{date}`, `{user}` and `{host}` (default: "upload")
    pub remote_path: String,

    /// Create missing remote directories before writing (default: false)
    pub auto_create_directory: bool,

    /// Marker appended to the remote name while content is in flight (default: ".tmp")
    pub temp_suffix: String,

    /// Host key verification policy (default: reject-all)
    pub host_key_policy: HostKeyPolicy,

    /// Local staging directory
    pub local_temp_path: PathBuf,

    /// Idle age after which a cached session is evicted (default: 300s)
    pub session_idle_timeout: Duration,

    /// Concurrent sessions allowed per endpoint (default: 2)
    pub pool_capacity_per_key: usize,

    /// TCP connect + SSH handshake timeout (default: 10s)
    pub connect_timeout: Duration,

    /// Authentication timeout (default: 10s)
    pub auth_timeout: Duration,

    /// Timeout applied to every remote write chunk (default: 30s)
    pub write_timeout: Duration,

    /// Remote write chunk size in bytes (default: 32 KB)
    pub chunk_size: usize,

    /// Maximum request body size in bytes (default: 64 MB)
    pub max_payload_size: usize,

    /// Dispatch mode (default: sync)
    pub dispatch_mode: DispatchMode,

    /// Concurrent uploads in async mode (default: 4)
    pub worker_count: usize,

    /// Queued uploads in async mode before submissions are refused (default: 64)
    pub queue_capacity: usize,

    /// How long finished job records stay queryable (default: 1 hour)
    pub job_retention: Duration,

    /// Interval between maintenance passes (default: 60s)
    pub maintenance_interval: Duration,

    /// Staging file cleanup age in hours (default: 24)
    pub staging_cleanup_age_hours: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sftp_host: "127.0.0.1".to_string(),
            sftp_port: 22,
            sftp_user: "sftp".to_string(),
            sftp_password: None,
            sftp_private_key: None,
            sftp_private_key_passphrase: None,
            remote_path: "upload".to_string(),
            auto_create_directory: false,
            temp_suffix: ".tmp".to_string(),
            host_key_policy: HostKeyPolicy::RejectAll,
            local_temp_path: env::temp_dir().join("sftp-staging"),
            session_idle_timeout: Duration::from_secs(300),
            pool_capacity_per_key: 2,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            chunk_size: 32 * 1024,            // 32 KB
            max_payload_size: 64 * 1024 * 1024, // 64 MB
            dispatch_mode: DispatchMode::Sync,
            worker_count: 4,
            queue_capacity: 64,
            job_retention: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(60),
            staging_cleanup_age_hours: 24,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            sftp_host: env::var("SFTP_HOST").unwrap_or(default.sftp_host),

            sftp_port: env::var("SFTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.sftp_port),

            sftp_user: env::var("SFTP_USER").unwrap_or(default.sftp_user),

            sftp_password: env::var("SFTP_PASSWORD").ok().filter(|v| !v.is_empty()),

            sftp_private_key: env::var("SFTP_PRIVATE_KEY").ok().filter(|v| !v.is_empty()),

            sftp_private_key_passphrase: env::var("SFTP_PRIVATE_KEY_PASSPHRASE")
                .ok()
                .filter(|v| !v.is_empty()),

            remote_path: env::var("SFTP_REMOTE_PATH").unwrap_or(default.remote_path),

            auto_create_directory: env::var("SFTP_AUTO_CREATE_DIRECTORY")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.auto_create_directory),

            temp_suffix: env::var("SFTP_TEMP_SUFFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.temp_suffix),

            host_key_policy: env::var("SFTP_HOST_KEY_POLICY")
                .map(|v| HostKeyPolicy::parse(&v))
                .unwrap_or(default.host_key_policy),

            local_temp_path: env::var("LOCAL_TEMP_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.local_temp_path),

            session_idle_timeout: secs_var("SESSION_IDLE_TIMEOUT_SECS")
                .unwrap_or(default.session_idle_timeout),

            pool_capacity_per_key: env::var("POOL_CAPACITY_PER_KEY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default.pool_capacity_per_key),

            connect_timeout: secs_var("CONNECT_TIMEOUT_SECS").unwrap_or(default.connect_timeout),

            auth_timeout: secs_var("AUTH_TIMEOUT_SECS").unwrap_or(default.auth_timeout),

            write_timeout: secs_var("WRITE_TIMEOUT_SECS").unwrap_or(default.write_timeout),

            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default.chunk_size),

            max_payload_size: env::var("MAX_PAYLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_payload_size),

            dispatch_mode: env::var("DISPATCH_MODE")
                .ok()
                .and_then(|v| DispatchMode::parse(&v))
                .unwrap_or(default.dispatch_mode),

            worker_count: env::var("WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default.worker_count),

            queue_capacity: env::var("QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default.queue_capacity),

            job_retention: secs_var("JOB_RETENTION_SECS").unwrap_or(default.job_retention),

            maintenance_interval: secs_var("MAINTENANCE_INTERVAL_SECS")
                .filter(|d| !d.is_zero())
                .unwrap_or(default.maintenance_interval),

            staging_cleanup_age_hours: env::var("STAGING_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_cleanup_age_hours),
        }
    }

    /// Create config for development (local server, host keys not verified)
    pub fn development() -> Self {
        Self {
            sftp_host: "127.0.0.1".to_string(),
            sftp_port: 2222,
            sftp_user: "demo".to_string(),
            sftp_password: Some("demo".to_string()),
            host_key_policy: HostKeyPolicy::AcceptAny,
            session_idle_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Staging files older than this are swept by the background worker.
    pub fn staging_cleanup_age(&self) -> Duration {
        Duration::from_secs(self.staging_cleanup_age_hours * 3600)
    }
}

fn secs_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
