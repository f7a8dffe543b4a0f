//! Connected-client registry.
//!
//! One mutex guards the whole map; broadcast paths take a snapshot of
//! the matching senders before iterating so an emitter never blocks on
//! a slow socket (the per-client channel decouples them).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A connected WebSocket client.
pub struct Client {
    /// Registry id.
    pub id: u64,
    /// Whether the client has authenticated.
    pub authenticated: bool,
    /// Session bound at authentication.
    pub session_id: Option<String>,
    /// User bound at authentication.
    pub user_id: Option<String>,
    /// Transfers the client subscribed to.
    pub transfers: HashSet<String>,
    /// Peers the client subscribed to (implicit via transfers and
    /// messaging; populated by `subscribe`-style frames naming peers).
    pub peers: HashSet<String>,
    /// Groups the client joined.
    pub groups: HashSet<String>,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Last frame received from the client.
    pub last_activity: Instant,
    sender: mpsc::UnboundedSender<String>,
}

/// Snapshot handed to broadcast paths.
#[derive(Clone)]
pub struct ClientSnapshot {
    /// Registry id.
    pub id: u64,
    sender: mpsc::UnboundedSender<String>,
}

impl ClientSnapshot {
    /// Queues a frame for the client's writer task.
    pub fn send(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Registry of live connections, guarded by a single mutex.
pub struct ClientRegistry {
    clients: Mutex<HashMap<u64, Client>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its id and the receiver the
    /// writer task drains.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let now = Instant::now();
        self.clients.lock().insert(
            id,
            Client {
                id,
                authenticated: false,
                session_id: None,
                user_id: None,
                transfers: HashSet::new(),
                peers: HashSet::new(),
                groups: HashSet::new(),
                connected_at: now,
                last_activity: now,
                sender: tx,
            },
        );
        (id, rx)
    }

    /// Removes a connection.
    pub fn unregister(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Marks a client authenticated.
    pub fn authenticate(&self, id: u64, user_id: Option<String>, session_id: Option<String>) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            client.authenticated = true;
            client.user_id = user_id;
            client.session_id = session_id;
        }
    }

    /// Whether a client has authenticated.
    #[must_use]
    pub fn is_authenticated(&self, id: u64) -> bool {
        self.clients.lock().get(&id).is_some_and(|c| c.authenticated)
    }

    /// Records activity on a connection.
    pub fn touch(&self, id: u64) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            client.last_activity = Instant::now();
        }
    }

    /// Adds or removes a transfer subscription.
    pub fn set_transfer_subscription(&self, id: u64, transfer_id: &str, subscribed: bool) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            if subscribed {
                client.transfers.insert(transfer_id.to_string());
            } else {
                client.transfers.remove(transfer_id);
            }
        }
    }

    /// Adds or removes a peer subscription.
    pub fn set_peer_subscription(&self, id: u64, peer_id: &str, subscribed: bool) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            if subscribed {
                client.peers.insert(peer_id.to_string());
            } else {
                client.peers.remove(peer_id);
            }
        }
    }

    /// Adds or removes a group membership.
    pub fn set_group_membership(&self, id: u64, group_id: &str, joined: bool) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            if joined {
                client.groups.insert(group_id.to_string());
            } else {
                client.groups.remove(group_id);
            }
        }
    }

    /// Queues a frame for one client.
    pub fn send_to(&self, id: u64, frame: String) -> bool {
        self.clients
            .lock()
            .get(&id)
            .is_some_and(|c| c.sender.send(frame).is_ok())
    }

    /// Snapshots the authenticated clients matching `filter`, so the
    /// caller iterates without holding the lock.
    pub fn snapshot_matching(&self, filter: impl Fn(&Client) -> bool) -> Vec<ClientSnapshot> {
        self.clients
            .lock()
            .values()
            .filter(|c| c.authenticated && filter(c))
            .map(|c| ClientSnapshot {
                id: c.id,
                sender: c.sender.clone(),
            })
            .collect()
    }

    /// Removes clients idle longer than `max_idle`, returning their
    /// ids. Dropping the sender ends each writer task, which closes the
    /// socket.
    pub fn sweep_idle(&self, max_idle: std::time::Duration) -> Vec<u64> {
        let mut clients = self.clients.lock();
        let stale: Vec<u64> = clients
            .values()
            .filter(|c| c.last_activity.elapsed() > max_idle)
            .map(|c| c.id)
            .collect();
        for id in &stale {
            clients.remove(id);
        }
        stale
    }
}
