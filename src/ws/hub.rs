use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::messages::{Frame, CELL_UNLOCKED, EXISTING_USERS, USER_LEFT};
use crate::models::UserIdentity;
use crate::pubsub::PubSub;
use crate::ws::locks::CellLockManager;
use crate::ws::presence::PresenceRegistry;
use crate::ws::{
    BROADCAST_CHANNEL, CLIENT_SEND_BUFFER, ENQUEUE_TIMEOUT, HEALTH_CHECK_INTERVAL,
    HUB_CHANNEL_BUFFER, PONG_WAIT, STALE_GRACE,
};

/// Identifier of one physical connection. Identity is keyed by user, transport
/// by connection, echo suppression works on the connection id.
pub type ClientId = u64;

/// Hub tunables. Production uses the defaults, tests shrink the buffers.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames buffered per connection
    pub send_buffer: usize,
    /// Events buffered on each hub channel
    pub channel_buffer: usize,
    /// Cadence of the stale-connection sweep
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_buffer: CLIENT_SEND_BUFFER,
            channel_buffer: HUB_CHANNEL_BUFFER,
            sweep_interval: HEALTH_CHECK_INTERVAL,
        }
    }
}

/// How locally originated broadcasts reach the connected clients.
///
/// With a broker every envelope makes a round trip through the pub/sub
/// channel so all instances, this one included, fan it out locally. The
/// sender reference never crosses the broker, so the originating connection
/// sees its own message come back. Without a broker the envelope goes
/// straight onto the internal queue with the sender preserved.
pub enum Bridge {
    Broker(Arc<dyn PubSub>),
    Direct,
}

/// Serialized frame on its way to the clients, with the originating
/// connection when one exists so the fan-out can skip it.
pub(crate) struct BroadcastEnvelope {
    pub message: String,
    pub sender: Option<ClientId>,
}

/// Hub-side handle to one connection. Cheap to clone, shared between the
/// roster, the connection tasks, and cleanup workers.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    user: Arc<UserIdentity>,
    user_key: String,
    sender: mpsc::Sender<String>,
    last_pong: Arc<Mutex<Instant>>,
    closer: Arc<Notify>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Record a heartbeat response.
    pub fn touch(&self) {
        *self.last_pong.lock().expect("last_pong poisoned") = Instant::now();
    }

    /// Resolves when the hub force-closes this connection.
    pub async fn closed(&self) {
        self.closer.notified().await;
    }

    fn force_close(&self) {
        self.closer.notify_one();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_pong.lock().expect("last_pong poisoned").elapsed() > threshold
    }

    #[cfg(test)]
    pub(crate) fn rewind_last_pong(&self, by: Duration) {
        let mut last_pong = self.last_pong.lock().expect("last_pong poisoned");
        *last_pong = Instant::now() - by;
    }
}

/// A freshly registered connection: the shared handle plus the receiving end
/// of its send buffer, consumed by the connection's write pump.
pub struct AttachedClient {
    pub handle: ClientHandle,
    pub receiver: mpsc::Receiver<String>,
}

/// Connection membership. Written only by the hub loop, read everywhere.
#[derive(Default)]
struct Roster {
    clients: HashMap<ClientId, ClientHandle>,
    user_clients: HashMap<String, HashSet<ClientId>>,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_broadcast: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Point-in-time hub statistics for diagnostics
#[derive(Debug, Clone)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_users: usize,
    pub presence_entries: usize,
    pub locked_cells: usize,
    pub total_connections: u64,
    pub messages_broadcast: u64,
    pub messages_dropped: u64,
}

/// The realtime hub.
///
/// All membership changes and fan-outs are serialized through one event loop
/// so no operation ever composes locks over the membership maps. Work that
/// could block on a client's send buffer runs in transient workers instead.
pub struct Hub {
    roster: RwLock<Roster>,
    presence: PresenceRegistry,
    cell_locks: CellLockManager,
    bridge: Bridge,
    config: HubConfig,
    counters: Counters,
    next_client_id: AtomicU64,
    register_tx: mpsc::Sender<ClientHandle>,
    unregister_tx: mpsc::Sender<ClientHandle>,
    broadcast_tx: mpsc::Sender<BroadcastEnvelope>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the hub's event loop. Spawn `run` once at startup.
pub struct HubRunner {
    hub: Arc<Hub>,
    register_rx: mpsc::Receiver<ClientHandle>,
    unregister_rx: mpsc::Receiver<ClientHandle>,
    broadcast_rx: mpsc::Receiver<BroadcastEnvelope>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Hub {
    pub fn new(bridge: Bridge, config: HubConfig) -> (Arc<Hub>, HubRunner) {
        let (register_tx, register_rx) = mpsc::channel(config.channel_buffer);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.channel_buffer);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.channel_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(Hub {
            roster: RwLock::new(Roster::default()),
            presence: PresenceRegistry::new(),
            cell_locks: CellLockManager::new(),
            bridge,
            config,
            counters: Counters::default(),
            next_client_id: AtomicU64::new(1),
            register_tx,
            unregister_tx,
            broadcast_tx,
            shutdown_tx,
        });

        let runner = HubRunner {
            hub: Arc::clone(&hub),
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown_rx,
        };

        (hub, runner)
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn cell_locks(&self) -> &CellLockManager {
        &self.cell_locks
    }

    /// Register a new connection for an authenticated user.
    pub async fn attach(&self, user: UserIdentity) -> AttachedClient {
        let (sender, receiver) = mpsc::channel(self.config.send_buffer);
        let handle = ClientHandle {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            user_key: user.user_key(),
            user: Arc::new(user),
            sender,
            last_pong: Arc::new(Mutex::new(Instant::now())),
            closer: Arc::new(Notify::new()),
        };
        if self.register_tx.send(handle.clone()).await.is_err() {
            error!("Hub is not running, dropping registration");
        }
        AttachedClient { handle, receiver }
    }

    /// Deregister a connection. Idempotent, both pumps funnel through here.
    pub async fn detach(&self, handle: ClientHandle) {
        if self.unregister_tx.send(handle).await.is_err() {
            error!("Hub is not running, dropping deregistration");
        }
    }

    /// Stop the event loop. `HubRunner::run` joins outstanding workers
    /// before returning.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Announce a committed mutation to every connected client on every
    /// instance. Called by the CRUD layer after a write lands.
    pub async fn broadcast_update(&self, kind: &str, payload: Value) {
        self.broadcast_message(kind, payload, None).await;
    }

    /// Serialize a frame and route it to all clients, excluding the sending
    /// connection when one is given. With a broker the envelope loops through
    /// the pub/sub channel first and the sender exclusion is lost on the way,
    /// which the frontend tolerates.
    pub(crate) async fn broadcast_message(
        &self,
        kind: &str,
        payload: Value,
        sender: Option<ClientId>,
    ) {
        let frame = Frame::new(kind, payload);
        let message = match frame.to_json() {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to serialize {} frame: {}", kind, e);
                return;
            }
        };

        match &self.bridge {
            Bridge::Broker(pubsub) => {
                if let Err(e) = pubsub.publish(BROADCAST_CHANNEL, message).await {
                    error!("Failed to publish {} frame: {}", kind, e);
                }
            }
            Bridge::Direct => {
                self.enqueue_broadcast(BroadcastEnvelope { message, sender })
                    .await;
            }
        }
    }

    async fn enqueue_broadcast(&self, envelope: BroadcastEnvelope) {
        if self
            .broadcast_tx
            .send_timeout(envelope, ENQUEUE_TIMEOUT)
            .await
            .is_err()
        {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Broadcast queue full, dropping message");
        }
    }

    pub fn stats(&self) -> HubStats {
        let roster = self.roster.read().expect("roster poisoned");
        HubStats {
            active_connections: roster.clients.len(),
            active_users: roster.user_clients.len(),
            presence_entries: self.presence.len(),
            locked_cells: self.cell_locks.len(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            messages_broadcast: self.counters.messages_broadcast.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of open connections for one user.
    pub fn session_count(&self, user_key: &str) -> usize {
        self.roster
            .read()
            .expect("roster poisoned")
            .user_clients
            .get(user_key)
            .map_or(0, |ids| ids.len())
    }

    fn register_client(self: &Arc<Self>, client: ClientHandle, workers: &mut JoinSet<()>) {
        let sessions = {
            let mut roster = self.roster.write().expect("roster poisoned");
            roster.clients.insert(client.id, client.clone());
            let ids = roster
                .user_clients
                .entry(client.user_key.clone())
                .or_default();
            ids.insert(client.id);
            ids.len()
        };
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(
            "User {} connected (sessions: {})",
            client.user.username, sessions
        );

        // Delivered from a worker because the send can block on a saturated
        // buffer, and the loop must keep serving everyone else.
        let hub = Arc::clone(self);
        workers.spawn(async move {
            hub.send_existing_users(client).await;
        });
    }

    async fn send_existing_users(&self, client: ClientHandle) {
        let positions = self.presence.get_all_except(&client.user_key);

        let mut users = serde_json::Map::new();
        {
            let roster = self.roster.read().expect("roster poisoned");
            for (user_key, position) in &positions {
                // Any live session of the user carries its identity fields
                let Some(info) = roster
                    .user_clients
                    .get(user_key)
                    .and_then(|ids| ids.iter().next())
                    .and_then(|id| roster.clients.get(id))
                    .map(|peer| Arc::clone(&peer.user))
                else {
                    continue;
                };
                users.insert(
                    user_key.clone(),
                    json!({
                        "row": position.row,
                        "col": position.col,
                        "userId": info.user_id,
                        "username": info.username,
                        "firstname": info.firstname,
                        "lastname": info.lastname,
                        "color": info.color,
                    }),
                );
            }
        }

        let mut locked_cells = serde_json::Map::new();
        for (lock_key, lock) in self.cell_locks.snapshot() {
            locked_cells.insert(
                lock_key,
                json!({
                    "userId": lock.user_id,
                    "firstname": lock.firstname,
                    "lastname": lock.lastname,
                    "color": lock.color,
                }),
            );
        }

        let frame = Frame::new(
            EXISTING_USERS,
            json!({ "users": users, "lockedCells": locked_cells }),
        );
        let message = match frame.to_json() {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to serialize existing users: {}", e);
                return;
            }
        };

        if client
            .sender
            .send_timeout(message, ENQUEUE_TIMEOUT)
            .await
            .is_err()
        {
            warn!(
                "Timeout sending existing users to {}",
                client.user.username
            );
        }
    }

    fn unregister_client(self: &Arc<Self>, client: ClientHandle, workers: &mut JoinSet<()>) {
        let (was_registered, last_session) = {
            let mut roster = self.roster.write().expect("roster poisoned");
            if roster.clients.remove(&client.id).is_none() {
                (false, false)
            } else {
                let mut last_session = false;
                if let Some(ids) = roster.user_clients.get_mut(&client.user_key) {
                    ids.remove(&client.id);
                    if ids.is_empty() {
                        roster.user_clients.remove(&client.user_key);
                        last_session = true;
                    }
                }
                (true, last_session)
            }
        };
        if !was_registered {
            return;
        }

        client.force_close();
        info!("User {} disconnected session", client.user.username);

        // Presence and locks survive as long as any session of the user does
        if last_session {
            let hub = Arc::clone(self);
            workers.spawn(async move {
                hub.cleanup_user(client).await;
            });
        }
    }

    async fn cleanup_user(&self, client: ClientHandle) {
        // The user may have reconnected before this worker ran
        {
            let roster = self.roster.read().expect("roster poisoned");
            if roster.user_clients.contains_key(&client.user_key) {
                return;
            }
        }

        if self.presence.remove(&client.user_key) {
            self.broadcast_message(USER_LEFT, json!({ "clientId": client.user_key }), None)
                .await;
        }

        for lock_key in self.cell_locks.release_all_for_user(&client.user_key) {
            let Some((asset_id, key)) = lock_key.split_once(':') else {
                continue;
            };
            self.broadcast_message(
                CELL_UNLOCKED,
                json!({ "assetId": asset_id, "key": key }),
                None,
            )
            .await;
        }
    }

    fn send_to_clients(&self, envelope: BroadcastEnvelope) {
        let roster = self.roster.read().expect("roster poisoned");
        for (id, client) in &roster.clients {
            // Skip the exact connection that sent this. Other connections of
            // the same user still receive it so every tab stays current.
            if envelope.sender == Some(*id) {
                continue;
            }
            match client.sender.try_send(envelope.message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "User {} send buffer full, skipping message",
                        client.user.username
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.counters.messages_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    fn check_stale_connections(&self) {
        let threshold = PONG_WAIT + STALE_GRACE;
        let stale: Vec<ClientHandle> = {
            let roster = self.roster.read().expect("roster poisoned");
            debug!(
                "Active users: {} | Total connections: {}",
                self.presence.len(),
                roster.clients.len()
            );
            roster
                .clients
                .values()
                .filter(|client| client.is_stale(threshold))
                .cloned()
                .collect()
        };

        if stale.is_empty() {
            return;
        }
        warn!("Health check: cleaning up {} stale connections", stale.len());
        for client in stale {
            // Closing funnels the connection through the unregister path
            client.force_close();
        }
    }
}

impl HubRunner {
    /// Run the hub event loop until shutdown, then join the workers.
    pub async fn run(mut self) {
        if let Bridge::Broker(pubsub) = &self.hub.bridge {
            match pubsub.subscribe(BROADCAST_CHANNEL).await {
                Ok(mut messages) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        while let Some(message) = messages.recv().await {
                            // Remote envelopes carry no sender, every local
                            // client receives them
                            hub.enqueue_broadcast(BroadcastEnvelope {
                                message,
                                sender: None,
                            })
                            .await;
                        }
                        warn!("Broker subscription on {} ended", BROADCAST_CHANNEL);
                    });
                }
                Err(e) => error!("Failed to subscribe to {}: {}", BROADCAST_CHANNEL, e),
            }
        }

        let mut sweep = tokio::time::interval(self.hub.config.sweep_interval);
        let mut workers = JoinSet::new();

        info!("Hub started, ready for websocket connections");

        loop {
            tokio::select! {
                Some(client) = self.register_rx.recv() => {
                    self.hub.register_client(client, &mut workers);
                }
                Some(client) = self.unregister_rx.recv() => {
                    self.hub.unregister_client(client, &mut workers);
                }
                Some(envelope) = self.broadcast_rx.recv() => {
                    self.hub.send_to_clients(envelope);
                }
                _ = sweep.tick() => {
                    self.hub.check_stale_connections();
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
                _ = self.shutdown_rx.changed() => {
                    info!("Hub shutting down");
                    break;
                }
            }
        }

        while workers.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryPubSub;
    use serde_json::json;

    fn identity(user_id: i64, username: &str) -> UserIdentity {
        UserIdentity {
            user_id,
            username: username.to_string(),
            firstname: "Test".to_string(),
            lastname: "User".to_string(),
            color: "#6b7280".to_string(),
        }
    }

    fn start_hub(bridge: Bridge, config: HubConfig) -> Arc<Hub> {
        let (hub, runner) = Hub::new(bridge, config);
        tokio::spawn(runner.run());
        hub
    }

    async fn recv_frame(receiver: &mut mpsc::Receiver<String>) -> Frame {
        let raw = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("send channel closed");
        serde_json::from_str(&raw).expect("invalid frame")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn session_sets_track_connections() {
        let hub = start_hub(Bridge::Direct, HubConfig::default());

        let s1 = hub.attach(identity(7, "alice")).await;
        let s2 = hub.attach(identity(7, "alice")).await;
        let b = hub.attach(identity(9, "bob")).await;
        settle().await;

        assert_eq!(hub.session_count("7"), 2);
        assert_eq!(hub.session_count("9"), 1);
        let stats = hub.stats();
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.total_connections, 3);

        hub.detach(s1.handle).await;
        settle().await;
        assert_eq!(hub.session_count("7"), 1);
        assert_eq!(hub.stats().active_connections, 2);

        drop((s2, b));
    }

    #[tokio::test]
    async fn broadcast_skips_only_the_sending_connection() {
        let hub = start_hub(Bridge::Direct, HubConfig::default());

        let mut s1 = hub.attach(identity(7, "alice")).await;
        let mut s2 = hub.attach(identity(7, "alice")).await;
        let mut b = hub.attach(identity(9, "bob")).await;
        settle().await;

        // Drain the registration frames
        assert_eq!(recv_frame(&mut s1.receiver).await.kind, EXISTING_USERS);
        assert_eq!(recv_frame(&mut s2.receiver).await.kind, EXISTING_USERS);
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        hub.broadcast_message(
            "USER_POSITION_UPDATE",
            json!({ "clientId": "7", "row": 4, "col": 4 }),
            Some(s1.handle.id()),
        )
        .await;

        // The other session of the same user and the peer both receive it
        assert_eq!(recv_frame(&mut s2.receiver).await.kind, "USER_POSITION_UPDATE");
        assert_eq!(recv_frame(&mut b.receiver).await.kind, "USER_POSITION_UPDATE");

        // The sending connection does not
        settle().await;
        assert!(s1.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn existing_users_carries_presence_and_locks() {
        let hub = start_hub(Bridge::Direct, HubConfig::default());

        let _a = hub.attach(identity(7, "alice")).await;
        let _c = hub.attach(identity(11, "carol")).await;
        settle().await;

        // Alice published a position, Carol never did
        hub.presence().set("7", 1, 1);
        hub.cell_locks().lock(
            "42:model",
            crate::ws::locks::CellLockInfo {
                user_id: "7".to_string(),
                asset_id: "42".to_string(),
                key: "model".to_string(),
                firstname: "Test".to_string(),
                lastname: "User".to_string(),
                color: "#6b7280".to_string(),
            },
        );

        let mut b = hub.attach(identity(9, "bob")).await;
        let frame = recv_frame(&mut b.receiver).await;
        assert_eq!(frame.kind, EXISTING_USERS);

        let users = frame.payload["users"].as_object().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users["7"]["row"], 1);
        assert_eq!(users["7"]["username"], "alice");
        assert!(!users.contains_key("11"));

        let locked = frame.payload["lockedCells"].as_object().unwrap();
        assert_eq!(locked["42:model"]["userId"], "7");
    }

    #[tokio::test]
    async fn user_left_only_after_last_session_departs() {
        let hub = start_hub(Bridge::Direct, HubConfig::default());

        let mut b = hub.attach(identity(9, "bob")).await;
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        let s1 = hub.attach(identity(7, "alice")).await;
        let s2 = hub.attach(identity(7, "alice")).await;
        settle().await;

        hub.presence().set("7", 4, 4);
        hub.cell_locks().lock(
            "42:model",
            crate::ws::locks::CellLockInfo {
                user_id: "7".to_string(),
                asset_id: "42".to_string(),
                key: "model".to_string(),
                firstname: "Test".to_string(),
                lastname: "User".to_string(),
                color: "#6b7280".to_string(),
            },
        );

        hub.detach(s1.handle).await;
        settle().await;
        // The other tab still represents the user
        assert!(b.receiver.try_recv().is_err());
        assert!(hub.presence().get("7").is_some());

        hub.detach(s2.handle).await;
        let left = recv_frame(&mut b.receiver).await;
        assert_eq!(left.kind, USER_LEFT);
        assert_eq!(left.payload["clientId"], "7");

        let unlocked = recv_frame(&mut b.receiver).await;
        assert_eq!(unlocked.kind, CELL_UNLOCKED);
        assert_eq!(unlocked.payload["assetId"], "42");
        assert_eq!(unlocked.payload["key"], "model");

        assert!(hub.presence().get("7").is_none());
        assert!(hub.cell_locks().is_empty());
    }

    #[tokio::test]
    async fn slow_client_degrades_only_itself() {
        let config = HubConfig {
            send_buffer: 8,
            ..HubConfig::default()
        };
        let hub = start_hub(Bridge::Direct, config);

        let mut a = hub.attach(identity(7, "alice")).await;
        let b = hub.attach(identity(9, "bob")).await;
        settle().await;

        // Bob never drains, the registration frame sits in his buffer and the
        // eight broadcasts below overflow it by exactly one
        assert_eq!(recv_frame(&mut a.receiver).await.kind, EXISTING_USERS);

        for i in 0..8 {
            hub.broadcast_message("USER_POSITION_UPDATE", json!({ "row": i, "col": i }), None)
                .await;
        }

        // Alice saw everything
        for _ in 0..8 {
            assert_eq!(recv_frame(&mut a.receiver).await.kind, "USER_POSITION_UPDATE");
        }
        settle().await;
        assert_eq!(hub.stats().messages_dropped, 1);

        drop(b);
    }

    #[tokio::test]
    async fn broker_loopback_echoes_to_the_sender() {
        let fabric: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let hub = start_hub(Bridge::Broker(fabric), HubConfig::default());

        let mut a = hub.attach(identity(7, "alice")).await;
        let mut b = hub.attach(identity(9, "bob")).await;
        settle().await;
        assert_eq!(recv_frame(&mut a.receiver).await.kind, EXISTING_USERS);
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        hub.broadcast_message(
            "CELL_LOCKED",
            json!({ "assetId": 42, "key": "model", "userId": "7" }),
            Some(a.handle.id()),
        )
        .await;

        // The sender reference does not cross the broker, so the envelope
        // comes back to the originating connection as well
        assert_eq!(recv_frame(&mut a.receiver).await.kind, "CELL_LOCKED");
        assert_eq!(recv_frame(&mut b.receiver).await.kind, "CELL_LOCKED");
    }

    #[tokio::test]
    async fn broadcast_update_reaches_every_client() {
        let hub = start_hub(Bridge::Direct, HubConfig::default());

        let mut a = hub.attach(identity(7, "alice")).await;
        settle().await;
        assert_eq!(recv_frame(&mut a.receiver).await.kind, EXISTING_USERS);

        hub.broadcast_update("asset_update", json!({ "id": 42, "key": "model", "value": "X9" }))
            .await;

        let frame = recv_frame(&mut a.receiver).await;
        assert_eq!(frame.kind, "asset_update");
        assert_eq!(frame.payload["value"], "X9");
    }

    #[tokio::test]
    async fn liveness_sweep_force_closes_stale_connections() {
        let config = HubConfig {
            sweep_interval: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let hub = start_hub(Bridge::Direct, config);

        let a = hub.attach(identity(7, "alice")).await;
        settle().await;

        a.handle.rewind_last_pong(PONG_WAIT + STALE_GRACE + Duration::from_secs(1));

        tokio::time::timeout(Duration::from_secs(1), a.handle.closed())
            .await
            .expect("stale connection was not force-closed");
    }
}
