//! Message service: per-peer journal with the delivery state machine.

use std::sync::Arc;
use std::time::Duration;

use firma_sign_proto::ids::{MessageId, PeerId, Timestamp};
use firma_sign_proto::message::{Attachment, MessageDirection, MessageStatus, MessageType};

use crate::db::messages::{HistoryPage, MessageRow, NewMessage};
use crate::db::{Database, messages};
use crate::error::ApiError;
use crate::events::{Event, EventBus};

/// Delay before a synthetic transport acknowledges delivery.
const SYNTHETIC_ACK_DELAY: Duration = Duration::from_millis(50);

/// Cap on search results.
const SEARCH_LIMIT: u32 = 100;

/// Options for [`MessageService::send`].
#[derive(Debug, Clone)]
pub struct SendMessageOptions {
    /// Message body.
    pub content: String,
    /// Message kind (default `text`).
    pub message_type: MessageType,
    /// Transport to deliver over (default `web`).
    pub transport: Option<String>,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Whether the content is encrypted.
    pub encrypted: bool,
}

impl SendMessageOptions {
    /// Plain text options.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            transport: None,
            attachments: Vec::new(),
            encrypted: false,
        }
    }
}

/// Receipt returned by [`MessageService::send`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// Stored message id.
    pub message_id: String,
    /// Status at acceptance.
    pub status: String,
    /// Acceptance timestamp.
    pub timestamp: Timestamp,
}

/// A page of conversation history.
#[derive(Debug)]
pub struct MessageHistory {
    /// Messages, newest first.
    pub messages: Vec<MessageRow>,
    /// Whether older messages remain beyond this page.
    pub has_more: bool,
}

/// Outcome of a mark-read call.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// Number of messages transitioned to `read`.
    pub updated: u32,
    /// The read timestamp applied.
    pub read_at: Timestamp,
}

/// Per-peer message journal.
pub struct MessageService {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    local_peer: PeerId,
}

impl MessageService {
    /// Creates the service. `local_peer` is the identity messages are
    /// sent from by default.
    #[must_use]
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>, local_peer: PeerId) -> Self {
        Self {
            db,
            bus,
            local_peer,
        }
    }

    /// The local peer identity.
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Sends a message from the local peer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an empty body or
    /// [`ApiError::Storage`] when persistence fails.
    pub fn send(
        self: &Arc<Self>,
        to: &PeerId,
        options: SendMessageOptions,
    ) -> Result<SendReceipt, ApiError> {
        let from = self.local_peer.clone();
        self.send_from(&from, to, options)
    }

    /// Sends a message on behalf of `from` (group fan-out path).
    ///
    /// The row is persisted with status `sent` and flips to `delivered`
    /// asynchronously once the transport acknowledges (simulated after
    /// a short delay for synthetic transports).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an empty body or
    /// [`ApiError::Storage`] when persistence fails.
    pub fn send_from(
        self: &Arc<Self>,
        from: &PeerId,
        to: &PeerId,
        options: SendMessageOptions,
    ) -> Result<SendReceipt, ApiError> {
        if options.content.is_empty() {
            return Err(ApiError::invalid("content", "must not be empty"));
        }
        let message = NewMessage {
            id: MessageId::new(),
            from_peer: from.clone(),
            to_peer: to.clone(),
            content: options.content,
            message_type: options.message_type,
            transport: Some(options.transport.unwrap_or_else(|| "web".to_string())),
            direction: if *from == self.local_peer {
                MessageDirection::Outgoing
            } else {
                MessageDirection::Incoming
            },
            status: MessageStatus::Sent,
            attachments: options.attachments,
            encrypted: options.encrypted,
        };
        let row = self.db.with_conn(|conn| messages::insert(conn, &message))?;

        self.bus.publish(&Event::MessageSent {
            message_id: row.id.to_string(),
            from: row.from_peer.to_string(),
            to: row.to_peer.to_string(),
        });
        self.schedule_delivery_ack(row.id.clone());

        Ok(SendReceipt {
            message_id: row.id.to_string(),
            status: row.status.as_str().to_string(),
            timestamp: row.created_at,
        })
    }

    /// Flips the message to `delivered` after the synthetic ack delay.
    fn schedule_delivery_ack(self: &Arc<Self>, id: MessageId) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SYNTHETIC_ACK_DELAY).await;
            service.acknowledge_delivery(&id);
        });
    }

    /// Records a transport delivery acknowledgment.
    pub fn acknowledge_delivery(&self, id: &MessageId) {
        let result = self
            .db
            .with_conn(|conn| messages::advance_status(conn, id, MessageStatus::Delivered));
        match result {
            Ok(row) => {
                self.bus.publish(&Event::MessageDelivered {
                    message_id: row.id.to_string(),
                    from: row.from_peer.to_string(),
                    to: row.to_peer.to_string(),
                });
            }
            Err(crate::db::StoreError::Constraint { .. }) => {
                // Already read (or failed); the ack arrived late.
            }
            Err(e) => {
                tracing::warn!(message = %id, error = %e, "delivery ack could not be recorded");
            }
        }
    }

    /// Returns the most recent messages between the local peer and
    /// `peer`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn history(&self, peer: &PeerId, page: &HistoryPage) -> Result<MessageHistory, ApiError> {
        let (messages, has_more) = self
            .db
            .with_conn(|conn| messages::find_between(conn, &self.local_peer, peer, page))?;
        Ok(MessageHistory { messages, has_more })
    }

    /// Marks messages from `peer` to the local peer as read. With
    /// `ids`, only those messages (and only ones addressed to the local
    /// peer and not yet read) are touched; repeating the call reports
    /// `updated = 0`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn mark_read(
        &self,
        peer: &PeerId,
        ids: Option<&[MessageId]>,
    ) -> Result<ReadReceipt, ApiError> {
        let (updated, read_at) = self
            .db
            .with_conn(|conn| messages::mark_read(conn, &self.local_peer, peer, ids))?;
        if updated > 0 {
            self.bus.publish(&Event::MessageRead {
                peer_id: peer.to_string(),
                count: updated,
            });
        }
        Ok(ReadReceipt { updated, read_at })
    }

    /// Counts unread messages addressed to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn unread_count(&self, peer: &PeerId) -> Result<u32, ApiError> {
        Ok(self.db.with_conn(|conn| messages::unread_count(conn, peer))?)
    }

    /// Substring search over the conversation with `peer`, newest
    /// first, capped.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn search(&self, peer: &PeerId, query: &str) -> Result<Vec<MessageRow>, ApiError> {
        Ok(self
            .db
            .with_conn(|conn| messages::search(conn, peer, query, SEARCH_LIMIT))?)
    }
}
