use crate::api::error::AppError;
use crate::config::GatewayConfig;
use crate::services::sftp::{Credentials, RemoteSession, SessionKey, SftpConnector, TransportError};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions that may be checked out for one key at the same time
    pub capacity_per_key: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_per_key: 2,
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&GatewayConfig> for PoolConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            capacity_per_key: config.pool_capacity_per_key.max(1),
            idle_timeout: config.session_idle_timeout,
            connect_timeout: config.connect_timeout,
            auth_timeout: config.auth_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct PoolStats {
    pub cached_sessions: usize,
    pub checked_out: usize,
    pub connections_established: u64,
    pub sessions_reused: u64,
    pub closed: bool,
}

struct IdleSession {
    session: Box<dyn RemoteSession>,
    created_at: Instant,
    last_used_at: Instant,
}

/// Per-key state: the permits bounding concurrent leases and the single
/// cached idle session.
struct KeySlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Option<IdleSession>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn connection_error(key: &SessionKey, source: TransportError) -> AppError {
    AppError::Connection {
        endpoint: key.endpoint(),
        source,
    }
}

/// Keyed cache of authenticated SFTP sessions.
///
/// A session is leased to exactly one caller at a time. Leases for the same
/// key are bounded by a semaphore, so callers beyond the capacity wait for a
/// lease to come back instead of opening more connections.
pub struct SessionPool {
    connector: Arc<dyn SftpConnector>,
    config: PoolConfig,
    slots: DashMap<SessionKey, Arc<KeySlot>>,
    closed: AtomicBool,
    established: AtomicU64,
    reused: AtomicU64,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn SftpConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            slots: DashMap::new(),
            closed: AtomicBool::new(false),
            established: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn slot(&self, key: &SessionKey) -> Arc<KeySlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(KeySlot {
                    permits: Arc::new(Semaphore::new(self.config.capacity_per_key)),
                    idle: Mutex::new(None),
                })
            })
            .clone()
    }

    fn ensure_open(&self, key: &SessionKey) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(connection_error(key, TransportError::PoolShutdown));
        }
        Ok(())
    }

    /// Leases a live session for `key`, reusing the cached one when its
    /// liveness probe passes and establishing a new one otherwise.
    pub async fn acquire(
        &self,
        key: &SessionKey,
        credentials: &Credentials,
    ) -> Result<PooledSession, AppError> {
        self.ensure_open(key)?;
        let slot = self.slot(key);

        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| connection_error(key, TransportError::PoolShutdown))?;
        self.ensure_open(key)?;

        let cached = lock(&slot.idle).take();
        if let Some(idle) = cached {
            match timeout(self.config.connect_timeout, idle.session.probe()).await {
                Ok(Ok(())) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "♻️  Reusing SFTP session for {} (idle {:?})",
                        key,
                        idle.last_used_at.elapsed()
                    );
                    return Ok(PooledSession::new(
                        key.clone(),
                        idle.session,
                        idle.created_at,
                        slot,
                        permit,
                    ));
                }
                Ok(Err(e)) => warn!("Discarding stale session for {}: {}", key, e),
                Err(_) => warn!("Liveness probe for {} timed out; discarding session", key),
            }
            self.close_session(key, idle.session).await;
        }

        let session = self.establish(key, credentials).await?;
        Ok(PooledSession::new(
            key.clone(),
            session,
            Instant::now(),
            slot,
            permit,
        ))
    }

    async fn establish(
        &self,
        key: &SessionKey,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, AppError> {
        let mut pending = timeout(self.config.connect_timeout, self.connector.connect(key))
            .await
            .map_err(|_| {
                connection_error(
                    key,
                    TransportError::Timeout {
                        op: "connect",
                        after: self.config.connect_timeout,
                    },
                )
            })?
            .map_err(|e| connection_error(key, e))?;

        let accepted = timeout(
            self.config.auth_timeout,
            pending.authenticate(&key.user, credentials),
        )
        .await
        .map_err(|_| AppError::Auth {
            endpoint: key.endpoint(),
            source: TransportError::Timeout {
                op: "authentication",
                after: self.config.auth_timeout,
            },
        })?
        .map_err(|e| match e {
            TransportError::Key(_) => AppError::Auth {
                endpoint: key.endpoint(),
                source: e,
            },
            other => connection_error(key, other),
        })?;

        if !accepted {
            return Err(AppError::Auth {
                endpoint: key.endpoint(),
                source: TransportError::AuthRejected {
                    user: key.user.clone(),
                    method: credentials.method(),
                },
            });
        }

        let session = timeout(self.config.connect_timeout, pending.open_sftp())
            .await
            .map_err(|_| {
                connection_error(
                    key,
                    TransportError::Timeout {
                        op: "sftp subsystem",
                        after: self.config.connect_timeout,
                    },
                )
            })?
            .map_err(|e| connection_error(key, e))?;

        let total = self.established.fetch_add(1, Ordering::Relaxed) + 1;
        info!("🔌 Established SFTP session to {} (#{})", key, total);
        Ok(session)
    }

    /// Returns a lease. Healthy sessions become the key's cached session if
    /// that slot is free; anything else is closed.
    pub async fn release(&self, mut lease: PooledSession) {
        let Some(session) = lease.session.take() else {
            return;
        };

        if !lease.healthy {
            debug!("Closing broken session for {}", lease.key);
            self.close_session(&lease.key, session).await;
            return;
        }

        let surplus = {
            let mut idle = lock(&lease.slot.idle);
            if self.is_closed() || idle.is_some() {
                Some(session)
            } else {
                *idle = Some(IdleSession {
                    session,
                    created_at: lease.created_at,
                    last_used_at: lease.last_used_at,
                });
                None
            }
        };

        if let Some(session) = surplus {
            debug!("Closing surplus session for {}", lease.key);
            self.close_session(&lease.key, session).await;
        }
    }

    /// Closes cached sessions idle for longer than the idle timeout.
    pub async fn evict_idle(&self) -> usize {
        let mut expired = Vec::new();
        for entry in self.slots.iter() {
            let mut idle = lock(&entry.value().idle);
            let is_expired = idle
                .as_ref()
                .is_some_and(|s| s.last_used_at.elapsed() >= self.config.idle_timeout);
            if is_expired {
                if let Some(session) = idle.take() {
                    expired.push((entry.key().clone(), session));
                }
            }
        }

        // Slots with no cached session and no lease holder are forgotten
        self.slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || lock(&slot.idle).is_some());

        let count = expired.len();
        for (key, idle) in expired {
            info!(
                "⏳ Evicting idle SFTP session for {} (idle {:?}, age {:?})",
                key,
                idle.last_used_at.elapsed(),
                idle.created_at.elapsed()
            );
            self.close_session(&key, idle.session).await;
        }
        count
    }

    /// Closes every cached session and refuses further acquisitions.
    /// Sessions still leased are closed when they come back.
    pub async fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let mut drained = Vec::new();
        for entry in self.slots.iter() {
            entry.value().permits.close();
            if let Some(idle) = lock(&entry.value().idle).take() {
                drained.push((entry.key().clone(), idle));
            }
        }

        let count = drained.len();
        for (key, idle) in drained {
            self.close_session(&key, idle.session).await;
        }
        info!("🔒 Session pool closed ({} cached sessions)", count);
        count
    }

    pub fn stats(&self) -> PoolStats {
        let mut cached_sessions = 0;
        let mut checked_out = 0;
        for entry in self.slots.iter() {
            let slot = entry.value();
            if lock(&slot.idle).is_some() {
                cached_sessions += 1;
            }
            checked_out += self
                .config
                .capacity_per_key
                .saturating_sub(slot.permits.available_permits());
        }

        PoolStats {
            cached_sessions,
            checked_out,
            connections_established: self.established.load(Ordering::Relaxed),
            sessions_reused: self.reused.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    async fn close_session(&self, key: &SessionKey, session: Box<dyn RemoteSession>) {
        if timeout(self.config.connect_timeout, session.close())
            .await
            .is_err()
        {
            debug!("Closing session for {} timed out", key);
        }
    }
}

/// A leased session. Hand it back with [`SessionPool::release`]; a lease
/// dropped without release discards its session.
pub struct PooledSession {
    key: SessionKey,
    session: Option<Box<dyn RemoteSession>>,
    created_at: Instant,
    last_used_at: Instant,
    healthy: bool,
    slot: Arc<KeySlot>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn new(
        key: SessionKey,
        session: Box<dyn RemoteSession>,
        created_at: Instant,
        slot: Arc<KeySlot>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            key,
            session: Some(session),
            created_at,
            last_used_at: Instant::now(),
            healthy: true,
            slot,
            _permit: permit,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn remote(&self) -> Result<&dyn RemoteSession, TransportError> {
        self.session.as_deref().ok_or(TransportError::Closed)
    }

    /// The session must not be handed out again.
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .field("healthy", &self.healthy)
            .field("open", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            debug!(
                "Lease for {} dropped without release; session discarded",
                self.key
            );
        }
    }
}
