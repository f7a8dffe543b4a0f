//! Typed internal event bus.
//!
//! Domain services publish [`Event`]s; consumers (the WebSocket gateway
//! foremost) hold an [`EventStream`]. Delivery fans out to subscribers
//! in registration order through bounded queues: a subscriber whose
//! queue is full is disconnected rather than ever blocking the emitter.
//! Per-topic FIFO for a single emitter follows from the per-subscriber
//! mpsc channels.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

/// Bound of each subscriber's queue.
pub const SUBSCRIBER_QUEUE_CAP: usize = 256;

/// Scope an event is delivered to at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Clients subscribed to this transfer.
    Transfer(String),
    /// Clients subscribed to this peer.
    Peer(String),
    /// Clients that joined this group.
    Group(String),
    /// Every authenticated client.
    Broadcast,
}

/// A domain event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A transfer was created.
    TransferCreated {
        /// The transfer.
        transfer_id: String,
        /// Its human code.
        code: Option<String>,
    },
    /// A transfer's status changed.
    TransferUpdated {
        /// The transfer.
        transfer_id: String,
        /// New status, canonical name.
        status: String,
    },
    /// A peer connection was established.
    PeerConnected {
        /// The peer.
        peer_id: String,
        /// The transport used.
        transport: String,
    },
    /// A peer connection closed.
    PeerDisconnected {
        /// The peer.
        peer_id: String,
        /// The transport used.
        transport: String,
    },
    /// A message was accepted and persisted.
    MessageSent {
        /// The message.
        message_id: String,
        /// Sender.
        from: String,
        /// Recipient.
        to: String,
    },
    /// A message delivery was acknowledged.
    MessageDelivered {
        /// The message.
        message_id: String,
        /// Sender.
        from: String,
        /// Recipient.
        to: String,
    },
    /// Messages were marked read.
    MessageRead {
        /// The peer whose messages were read.
        peer_id: String,
        /// How many messages were affected.
        count: u32,
    },
    /// A group was created.
    GroupCreated {
        /// The group.
        group_id: String,
        /// Group name.
        name: String,
    },
    /// A message fanned out to a group.
    GroupMessage {
        /// The group.
        group_id: String,
        /// Sending peer.
        from: String,
        /// Message body.
        message: String,
    },
    /// A member joined a group.
    GroupMemberAdded {
        /// The group.
        group_id: String,
        /// The member.
        peer_id: String,
    },
    /// A member left a group.
    GroupMemberRemoved {
        /// The group.
        group_id: String,
        /// The member.
        peer_id: String,
    },
    /// A member's role changed.
    GroupMemberUpdated {
        /// The group.
        group_id: String,
        /// The member.
        peer_id: String,
        /// New role.
        role: String,
    },
    /// A transport finished initialization.
    TransportInitialized {
        /// The transport.
        transport: String,
    },
    /// A transport reported an error.
    TransportError {
        /// The transport.
        transport: String,
        /// What went wrong.
        error: String,
    },
}

impl Event {
    /// The topic string, e.g. `transfer:update`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TransferCreated { .. } => "transfer:created",
            Self::TransferUpdated { .. } => "transfer:update",
            Self::PeerConnected { .. } => "peer:connected",
            Self::PeerDisconnected { .. } => "peer:disconnected",
            Self::MessageSent { .. } => "message:sent",
            Self::MessageDelivered { .. } => "message:delivered",
            Self::MessageRead { .. } => "message:read",
            Self::GroupCreated { .. } => "group:created",
            Self::GroupMessage { .. } => "group:message",
            Self::GroupMemberAdded { .. } => "group:member:added",
            Self::GroupMemberRemoved { .. } => "group:member:removed",
            Self::GroupMemberUpdated { .. } => "group:member:updated",
            Self::TransportInitialized { .. } => "transport:initialized",
            Self::TransportError { .. } => "transport:error",
        }
    }

    /// The delivery scope at the gateway.
    #[must_use]
    pub fn scope(&self) -> Scope {
        match self {
            Self::TransferCreated { transfer_id, .. }
            | Self::TransferUpdated { transfer_id, .. } => Scope::Transfer(transfer_id.clone()),
            Self::PeerConnected { peer_id, .. }
            | Self::PeerDisconnected { peer_id, .. }
            | Self::MessageRead { peer_id, .. } => Scope::Peer(peer_id.clone()),
            Self::MessageSent { to, .. } | Self::MessageDelivered { to, .. } => {
                Scope::Peer(to.clone())
            }
            Self::GroupCreated { group_id, .. }
            | Self::GroupMessage { group_id, .. }
            | Self::GroupMemberAdded { group_id, .. }
            | Self::GroupMemberRemoved { group_id, .. }
            | Self::GroupMemberUpdated { group_id, .. } => Scope::Group(group_id.clone()),
            Self::TransportInitialized { .. } | Self::TransportError { .. } => Scope::Broadcast,
        }
    }

    /// The payload carried in the gateway's `data` field.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::TransferCreated { code, .. } => json!({ "code": code }),
            Self::TransferUpdated { status, .. } => json!({ "status": status }),
            Self::PeerConnected { transport, .. } | Self::PeerDisconnected { transport, .. } => {
                json!({ "transport": transport })
            }
            Self::MessageSent {
                message_id, from, ..
            }
            | Self::MessageDelivered {
                message_id, from, ..
            } => json!({ "messageId": message_id, "from": from }),
            Self::MessageRead { count, .. } => json!({ "count": count }),
            Self::GroupCreated { name, .. } => json!({ "name": name }),
            Self::GroupMessage { from, message, .. } => {
                json!({ "from": from, "message": message })
            }
            Self::GroupMemberAdded { peer_id, .. } | Self::GroupMemberRemoved { peer_id, .. } => {
                json!({ "peerId": peer_id })
            }
            Self::GroupMemberUpdated { peer_id, role, .. } => {
                json!({ "peerId": peer_id, "role": role })
            }
            Self::TransportInitialized { transport } => json!({ "transport": transport }),
            Self::TransportError { transport, error } => {
                json!({ "transport": transport, "error": error })
            }
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Receiving half of a bus subscription.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Awaits the next event; `None` once disconnected.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for tests.
    ///
    /// # Errors
    ///
    /// Returns the underlying channel error when empty or disconnected.
    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Process-wide publish-subscribe for domain events.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber with a bounded queue.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscriber { id, tx });
        EventStream { rx }
    }

    /// Publishes an event to every subscriber, in registration order.
    ///
    /// Never blocks: a subscriber whose queue is full (or whose stream
    /// was dropped) is disconnected.
    pub fn publish(&self, event: &Event) {
        let mut dropped: Vec<u64> = Vec::new();
        let mut subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = subscriber.id,
                        event = event.name(),
                        "subscriber queue full, disconnecting"
                    );
                    dropped.push(subscriber.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(subscriber.id);
                }
            }
        }
        if !dropped.is_empty() {
            subscribers.retain(|s| !dropped.contains(&s.id));
        }
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
