//! WebSocket gateway frame protocol.
//!
//! Frames are JSON text, dispatched by their `type` field. Client frames
//! drive authentication and subscription management; server frames carry
//! acknowledgments and forwarded domain events. Every outbound server
//! frame carries a millisecond `timestamp`.

use serde::{Deserialize, Serialize};

use crate::ids::Timestamp;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Serialization or deserialization failed.
    #[error("frame serialization error: {0}")]
    Serialization(String),
}

/// Frames sent by a client to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticate with a JWT or a session id.
    #[serde(rename_all = "camelCase")]
    Auth {
        /// JWT (HS256) issued by the platform.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Session id checked against the injected validator.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Subscribe to a transfer's events. Requires authentication.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Transfer to watch.
        transfer_id: String,
    },
    /// Remove a transfer subscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Transfer to stop watching.
        transfer_id: String,
    },
    /// Join a group's event stream. Requires authentication.
    #[serde(rename_all = "camelCase")]
    JoinGroup {
        /// Group to join.
        group_id: String,
    },
    /// Leave a group's event stream.
    #[serde(rename_all = "camelCase")]
    LeaveGroup {
        /// Group to leave.
        group_id: String,
    },
    /// Send a message to a peer. Requires authentication.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Recipient peer id.
        peer_id: String,
        /// Message body.
        content: String,
        /// Transport to deliver over.
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<String>,
    },
    /// Keep-alive response.
    Pong,
}

/// Frames sent by the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Result of an `auth` frame.
    #[serde(rename_all = "camelCase")]
    AuthResult {
        /// Whether authentication succeeded.
        success: bool,
        /// Session id bound to the connection, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// User id bound to the connection, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Acknowledges a subscription.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// The subscribed transfer.
        transfer_id: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Acknowledges an unsubscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        /// The unsubscribed transfer.
        transfer_id: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Acknowledges joining a group stream.
    #[serde(rename_all = "camelCase")]
    JoinedGroup {
        /// The joined group.
        group_id: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Acknowledges leaving a group stream.
    #[serde(rename_all = "camelCase")]
    LeftGroup {
        /// The left group.
        group_id: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// A forwarded domain event.
    #[serde(rename_all = "camelCase")]
    Event {
        /// Topic name, e.g. `transfer:update`.
        event: String,
        /// Transfer scope, when the event belongs to one.
        #[serde(skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        /// Peer scope, when the event belongs to one.
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        /// Group scope, when the event belongs to one.
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        /// Event payload.
        data: serde_json::Value,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Echo that a `message` frame was accepted and persisted.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        /// Id of the stored message.
        message_id: String,
        /// Recipient peer.
        peer_id: String,
        /// Delivery status at acceptance time.
        status: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Error frame.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Human-readable error description.
        error: String,
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
    /// Keep-alive probe.
    Ping {
        /// Frame timestamp (millis).
        timestamp: Timestamp,
    },
}

/// Encodes a server frame to its JSON text form.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|e| FrameError::Serialization(e.to_string()))
}

/// Decodes a client frame from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] for malformed JSON or unknown
/// frame types.
pub fn decode_client(text: &str) -> Result<ClientFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Serialization(e.to_string()))
}

/// Decodes a server frame from JSON text (used by test clients).
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] for malformed JSON or unknown
/// frame types.
pub fn decode_server(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Serialization(e.to_string()))
}
