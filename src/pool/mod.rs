//! Client pool
//!
//! One live connection per fleet server, keyed by server id. Concurrent
//! requests for the same server share a single in-progress connect, idle
//! clients are closed by a background [`Reaper`], and a failed connect is
//! never cached.

pub mod connector;
mod reaper;
pub mod uri;

pub use connector::{command_name, CommandRunner, Connector, MongoConnector};
pub use reaper::Reaper;
pub use uri::{build_uri, SERVER_SELECTION_TIMEOUT_MS};

use bson::{oid::ObjectId, Document};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::db::redact;
use crate::db::schemas::{ServerDoc, UserDoc};
use crate::store::{server_root, EntityStore};
use crate::types::{FleetError, Result};

/// Default idle time before a client is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(150);

/// Default reaper sweep interval
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(15);

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Close a client after this long without use
    pub idle_timeout: Duration,
    /// How often the reaper sweeps for idle clients
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

/// A pooled connection to one fleet server
pub struct ClientHandle {
    server_id: ObjectId,
    server_name: String,
    uri: String,
    runner: Arc<dyn CommandRunner>,
    opened: Instant,
    connected_at: DateTime<Utc>,
    /// Milliseconds after `opened` of the last use
    last_used_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl ClientHandle {
    fn new(server: &ServerDoc, server_id: ObjectId, uri: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            server_id,
            server_name: server.name.clone(),
            uri: redact(uri),
            runner,
            opened: Instant::now(),
            connected_at: Utc::now(),
            last_used_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn server_id(&self) -> ObjectId {
        self.server_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Connection string with the password masked
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Commands currently running on this client
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Time since the client was last used
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst));
        self.opened.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.opened.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(now, Ordering::SeqCst);
    }

    /// Run a command against `db` on this server
    pub async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        self.touch();
        let _guard = InFlight::enter(&self.in_flight);

        debug!(
            server = %self.server_name,
            db = %db,
            command = %command_name(&command),
            "Running command"
        );

        let result = self.runner.run_command(db, command).await;
        self.touch();
        result
    }

    /// Run a command against the `admin` database
    pub async fn admin(&self, command: Document) -> Result<Document> {
        self.run_command("admin", command).await
    }

    async fn close(&self) -> Result<()> {
        self.runner.close().await
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            server_id: self.server_id.to_hex(),
            server_name: self.server_name.clone(),
            uri: self.uri.clone(),
            connected_at: self.connected_at,
            idle_ms: self.idle().as_millis() as u64,
            in_flight: self.in_flight(),
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("server_id", &self.server_id)
            .field("server_name", &self.server_name)
            .field("uri", &self.uri)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of one pooled client
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub server_id: String,
    pub server_name: String,
    pub uri: String,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub in_flight: usize,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connected: usize,
    pub connecting: usize,
    pub clients: Vec<ClientStats>,
}

type Slot = Arc<OnceCell<Arc<ClientHandle>>>;

/// Uninitialised and held only by the map: every caller that was connecting
/// has been cancelled
fn abandoned(slot: &Slot) -> bool {
    !slot.initialized() && Arc::strong_count(slot) == 1
}

/// Per-server cache of live connections
pub struct ClientPool {
    connector: Arc<dyn Connector>,
    clients: DashMap<ObjectId, Slot>,
    config: PoolConfig,
    reaper: Mutex<Option<Reaper>>,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            clients: DashMap::new(),
            config,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Cached client for a server, if connected
    pub fn cached(&self, server_id: &ObjectId) -> Option<Arc<ClientHandle>> {
        let slot = self.clients.get(server_id)?;
        let handle = slot.get()?.clone();
        handle.touch();
        Some(handle)
    }

    /// Return the cached client for `server`, creating it if needed
    pub async fn get_client(&self, server: &ServerDoc, root: Option<&UserDoc>) -> Result<Arc<ClientHandle>> {
        if let Some(id) = server._id {
            if let Some(handle) = self.cached(&id) {
                return Ok(handle);
            }
        }
        self.create_client(server, root).await
    }

    /// Connect to `server`. Idempotent: an existing client is returned as
    /// is, and concurrent callers share one connect attempt.
    pub async fn create_client(&self, server: &ServerDoc, root: Option<&UserDoc>) -> Result<Arc<ClientHandle>> {
        let id = server
            ._id
            .ok_or_else(|| FleetError::Validation(format!("server '{}' has no id", server.name)))?;

        let slot: Slot = self
            .clients
            .entry(id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = slot
            .get_or_try_init(|| self.connect(id, server, root))
            .await
            .cloned();

        match result {
            Ok(handle) => {
                handle.touch();
                Ok(handle)
            }
            Err(e) => {
                // Leave the slot free for the next attempt
                self.clients
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &slot) && current.get().is_none());
                warn!(server = %server.name, error = %e, "Failed to connect");
                Err(e)
            }
        }
    }

    async fn connect(&self, id: ObjectId, server: &ServerDoc, root: Option<&UserDoc>) -> Result<Arc<ClientHandle>> {
        let uri = build_uri(server, root);
        debug!(server = %server.name, uri = %redact(&uri), "Connecting");

        let runner = self.connector.connect(server, &uri).await?;
        let handle = Arc::new(ClientHandle::new(server, id, &uri, runner));

        info!(
            server = %server.name,
            server_id = %id,
            uri = %handle.uri(),
            "Client connected"
        );
        Ok(handle)
    }

    /// Populate the server's root credential from `store` and return its client
    pub async fn client_for<S>(&self, store: &S, server: &ServerDoc) -> Result<Arc<ClientHandle>>
    where
        S: EntityStore + ?Sized,
    {
        if let Some(handle) = server._id.and_then(|id| self.cached(&id)) {
            return Ok(handle);
        }
        let root = server_root(store, server).await?;
        self.create_client(server, root.as_ref()).await
    }

    /// Connect to every enabled server, logging failures. Returns how many
    /// servers have a live client afterwards.
    pub async fn connect_all<S>(&self, store: &S, servers: &[ServerDoc]) -> usize
    where
        S: EntityStore + ?Sized,
    {
        let mut connected = 0;
        for server in servers.iter().filter(|s| s.enabled) {
            match self.client_for(store, server).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(server = %server.name, error = %e, "Warm-up connect failed"),
            }
        }
        connected
    }

    /// Close and forget the client for a server. Returns the closed handle,
    /// or `None` when nothing was connected. Close errors are logged.
    pub async fn close_client(&self, server_id: &ObjectId) -> Option<Arc<ClientHandle>> {
        // A slot still connecting belongs to its caller
        let (_, slot) = self.clients.remove_if(server_id, |_, slot| slot.get().is_some())?;
        let handle = slot.get()?.clone();

        match handle.close().await {
            Ok(()) => info!(server = %handle.server_name(), "Client closed"),
            Err(e) => warn!(server = %handle.server_name(), error = %e, "Error closing client"),
        }
        Some(handle)
    }

    /// Forget slots whose connect attempt was cancelled before finishing.
    /// Slots with a caller still waiting are kept. Returns how many went.
    pub fn prune_abandoned(&self) -> usize {
        let mut pruned = 0;
        self.clients.retain(|_, slot| {
            let keep = !abandoned(slot);
            if !keep {
                pruned += 1;
            }
            keep
        });
        if pruned > 0 {
            debug!(pruned, "Pruned abandoned connect slots");
        }
        pruned
    }

    /// Close every connected client. Returns how many were closed.
    pub async fn close_clients(&self) -> usize {
        self.prune_abandoned();
        let ids: Vec<ObjectId> = self.clients.iter().map(|entry| *entry.key()).collect();

        let mut closed = 0;
        for id in ids {
            if self.close_client(&id).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    /// Close clients idle for at least `max_idle`. Clients with commands in
    /// flight are kept.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.prune_abandoned();
        let idle: Vec<ObjectId> = self
            .clients
            .iter()
            .filter_map(|entry| {
                let handle = entry.value().get()?;
                (handle.in_flight() == 0 && handle.idle() >= max_idle).then(|| *entry.key())
            })
            .collect();

        let mut evicted = 0;
        for id in idle {
            // Re-check: the client may have been used since the scan
            let still_idle = self
                .clients
                .get(&id)
                .and_then(|slot| slot.get().map(|h| h.in_flight() == 0 && h.idle() >= max_idle))
                .unwrap_or(false);

            if still_idle && self.close_client(&id).await.is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.len(), "Evicted idle clients");
        }
        evicted
    }

    /// Start the background idle reaper. A second call is a no-op.
    pub async fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().await;
        if reaper.as_ref().is_some_and(Reaper::is_running) {
            warn!("Reaper already running");
            return;
        }
        *reaper = Some(Reaper::spawn(
            Arc::downgrade(self),
            self.config.reaper_interval,
            self.config.idle_timeout,
        ));
    }

    /// Stop the background reaper and wait for it to exit
    pub async fn stop_reaper(&self) {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.stop().await;
        }
    }

    /// Stop the reaper and close every client
    pub async fn shutdown(&self) -> usize {
        self.stop_reaper().await;
        let closed = self.close_clients().await;
        info!(closed, "Client pool shut down");
        closed
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live client exists for the server
    pub fn contains(&self, server_id: &ObjectId) -> bool {
        self.clients
            .get(server_id)
            .is_some_and(|slot| slot.initialized())
    }

    pub fn stats(&self) -> PoolStats {
        let mut clients = Vec::new();
        let mut connecting = 0;
        for entry in self.clients.iter() {
            match entry.value().get() {
                Some(handle) => clients.push(handle.stats()),
                None if !abandoned(entry.value()) => connecting += 1,
                None => {}
            }
        }
        clients.sort_by(|a, b| a.server_name.cmp(&b.server_name));

        PoolStats {
            connected: clients.len(),
            connecting,
            clients,
        }
    }
}
