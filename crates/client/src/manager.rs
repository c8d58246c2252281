//! Connection lifecycle manager: caching, sharing, and idle teardown.
//!
//! The manager keeps at most one cached device connection. All lifecycle
//! state lives behind a single `tokio::sync::Mutex`, so every decision
//! (reuse vs. reconnect, refcount changes, idle-timer arming) happens in
//! one critical section and cannot interleave. Handshakes run while that
//! lock is held, which serializes concurrent first callers onto one
//! connect instead of racing several.
//!
//! Callers hold an [`ActiveUser`] guard for the duration of an operation.
//! The guard releases its reference in `Drop` by spawning the release
//! onto the runtime, so a caller cancelled mid-operation still decrements
//! the refcount. When the refcount reaches zero an idle task is armed;
//! it tears the connection down unless a new caller arrives first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wadb_protocol::{KeyMaterial, ProtocolError, Result};

use crate::config::Config;
use crate::connection::Connection;
use crate::pairing::PairingClient;

/// The cached connection and where it points.
struct CachedConnection {
    host: String,
    port: u16,
    connection: Arc<Mutex<Connection>>,
}

/// Lifecycle state, guarded by one mutex.
struct ManagerState {
    entry: Option<CachedConnection>,
    active_users: usize,
    idle_task: Option<JoinHandle<()>>,
}

/// RAII reference to the cached connection.
///
/// Dropping the guard spawns the release onto the runtime so that the
/// refcount is decremented even when the owning future is cancelled.
struct ActiveUser {
    state: Arc<Mutex<ManagerState>>,
    idle_timeout: Duration,
}

impl Drop for ActiveUser {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            release(state, idle_timeout).await;
        });
    }
}

async fn release(state_arc: Arc<Mutex<ManagerState>>, idle_timeout: Duration) {
    let mut state = state_arc.lock().await;
    state.active_users = state.active_users.saturating_sub(1);
    if state.active_users > 0 || state.entry.is_none() {
        return;
    }

    // Last user gone: (re)arm the idle teardown.
    if let Some(task) = state.idle_task.take() {
        task.abort();
    }
    let timer_state = Arc::clone(&state_arc);
    state.idle_task = Some(tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        let mut state = timer_state.lock().await;
        if state.active_users == 0 {
            if let Some(entry) = state.entry.take() {
                info!(host = %entry.host, port = entry.port, "closing idle connection");
                if let Ok(mut connection) = entry.connection.try_lock() {
                    connection.close().await;
                }
            }
        }
        state.idle_task = None;
    }));
}

/// Manages the shared device connection and the key material behind it.
pub struct ConnectionManager {
    key_path: PathBuf,
    device_name: String,
    read_timeout: Duration,
    idle_timeout: Duration,
    key: OnceCell<Arc<KeyMaterial>>,
    state: Arc<Mutex<ManagerState>>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        Self {
            key_path: config.key_path.clone(),
            device_name: config.device_name.clone(),
            read_timeout: config.read_timeout(),
            idle_timeout: config.idle_timeout(),
            key: OnceCell::new(),
            state: Arc::new(Mutex::new(ManagerState {
                entry: None,
                active_users: 0,
                idle_task: None,
            })),
        }
    }

    /// Runs one shell command against the device, reusing the cached
    /// connection when it points at the same destination and is live.
    ///
    /// Any failure during the exchange invalidates the cached connection
    /// before the error is surfaced; the next caller gets a fresh
    /// handshake rather than a poisoned socket.
    pub async fn run_shell_command(&self, host: &str, port: u16, command: &str) -> Result<String> {
        let (connection, _user) = self.acquire(host, port).await?;
        let mut guard = connection.lock().await;
        match guard.shell_command(command).await {
            Ok(output) => Ok(output),
            Err(err) => {
                drop(guard);
                warn!(error = %err, "shell exchange failed, invalidating connection");
                self.invalidate(&connection).await;
                Err(err)
            }
        }
    }

    /// Whether this client's key is currently accepted by the device. A
    /// completed handshake is the proof; an unpaired device never sends
    /// the accepting CNXN.
    pub async fn is_paired(&self, host: &str, port: u16) -> bool {
        self.acquire(host, port).await.is_ok()
    }

    /// Pairs with the device's pairing endpoint using the same key
    /// material regular connections authenticate with.
    pub async fn pair(&self, host: &str, port: u16, code: &str) -> Result<()> {
        let key = self.key_material().await?;
        PairingClient::new(key).pair(host, port, code).await
    }

    /// Returns the cached connection for `host:port`, establishing a new
    /// one if the cache is empty, dead, or points elsewhere.
    async fn acquire(&self, host: &str, port: u16) -> Result<(Arc<Mutex<Connection>>, ActiveUser)> {
        let mut state = self.state.lock().await;

        // A caller is here, so the connection is not idle.
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }

        let reusable = match &state.entry {
            Some(entry) if entry.host == host && entry.port == port => {
                // Locked means in use means live as far as we know.
                match entry.connection.try_lock() {
                    Ok(connection) => connection.is_live(),
                    Err(_) => true,
                }
            }
            _ => false,
        };

        let connection = if reusable {
            match &state.entry {
                Some(entry) => {
                    debug!(%host, port, "reusing cached connection");
                    Arc::clone(&entry.connection)
                }
                // Unreachable while the state lock is held.
                None => {
                    return Err(ProtocolError::Transport(
                        "connection cache emptied concurrently".into(),
                    ))
                }
            }
        } else {
            if let Some(old) = state.entry.take() {
                debug!(host = %old.host, port = old.port, "discarding cached connection");
                if let Ok(mut connection) = old.connection.try_lock() {
                    connection.close().await;
                }
            }
            let key = self.key_material().await?;
            // Holding the state lock here serializes handshakes: a second
            // caller waits instead of opening its own socket.
            let connection = Connection::establish(host, port, &key, self.read_timeout).await?;
            let connection = Arc::new(Mutex::new(connection));
            state.entry = Some(CachedConnection {
                host: host.to_string(),
                port,
                connection: Arc::clone(&connection),
            });
            connection
        };

        state.active_users += 1;
        let user = ActiveUser {
            state: Arc::clone(&self.state),
            idle_timeout: self.idle_timeout,
        };
        Ok((connection, user))
    }

    /// Drops the cached entry if it is still the given connection.
    async fn invalidate(&self, connection: &Arc<Mutex<Connection>>) {
        let mut state = self.state.lock().await;
        let is_current = state
            .entry
            .as_ref()
            .is_some_and(|entry| Arc::ptr_eq(&entry.connection, connection));
        if is_current {
            if let Some(entry) = state.entry.take() {
                if let Ok(mut connection) = entry.connection.try_lock() {
                    connection.close().await;
                }
            }
        }
    }

    /// Lazily creates the key material, exactly once per manager. RSA
    /// generation is CPU-bound and runs off the async threads.
    async fn key_material(&self) -> Result<Arc<KeyMaterial>> {
        let key = self
            .key
            .get_or_try_init(|| async {
                let path = self.key_path.clone();
                let name = self.device_name.clone();
                tokio::task::spawn_blocking(move || KeyMaterial::load_or_create(&path, &name))
                    .await
                    .map_err(|e| ProtocolError::Key(format!("key setup task failed: {e}")))?
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(key))
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("device_name", &self.device_name)
            .field("read_timeout", &self.read_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
