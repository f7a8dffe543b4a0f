//! Pluggable transport layer.
//!
//! Defines the [`Transport`] trait every delivery channel implements,
//! the [`TransportRegistry`](registry::TransportRegistry) that owns the
//! named instances, and [`channel::ChannelTransport`], the in-process
//! channel-backed transport that stands in for concrete channels (p2p,
//! email, discord, telegram) in tests and backs the `web` channel.
//!
//! Transports carry [`Envelope`]s and never interpret document bytes;
//! retry policy lives in the transfer router, not here.

pub mod channel;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use firma_sign_proto::ids::PeerId;
use firma_sign_proto::transfer::Envelope;

/// Transport names known to the platform.
pub const KNOWN_TRANSPORTS: [&str; 5] = ["p2p", "email", "discord", "telegram", "web"];

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The named transport is not registered or not active.
    #[error("transport {0} is not available")]
    Unavailable(String),

    /// A retryable failure (timeout, congestion, connection reset).
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// A non-retryable failure (authentication, rejected payload).
    #[error("permanent transport failure: {0}")]
    Permanent(String),

    /// The transport does not implement the requested operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Returns `true` when the caller may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Operational status of a transport, tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum TransportStatus {
    /// Registered but not yet initialized.
    Uninitialized,
    /// Initialized and accepting work.
    Active,
    /// Initialization or operation failed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// What went wrong.
        error: String,
    },
    /// Shut down.
    Shutdown,
}

impl TransportStatus {
    /// Returns `true` when the transport accepts work.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A peer candidate surfaced by a transport's discovery mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    /// Stable peer id, when the transport knows one.
    pub peer_id: Option<String>,
    /// Display name, when known.
    pub display_name: Option<String>,
    /// Transport-specific address.
    pub identifier: String,
    /// The transport that surfaced the candidate.
    pub transport: String,
}

/// Callback invoked for every envelope a transport receives.
pub type IncomingHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// A pluggable delivery channel.
///
/// Implementations own their concurrency; the registry never shares one
/// instance across two names. `connect`, `disconnect`, and
/// `discover_peers` are optional capabilities and default to
/// [`TransportError::Unsupported`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// The transport's registered name (`p2p`, `email`, ...).
    fn name(&self) -> &str;

    /// Applies configuration and brings the transport up.
    async fn initialize(&self, config: serde_json::Value) -> Result<(), TransportError>;

    /// Delivers an envelope to the recipient addressed in it.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Registers the callback for inbound envelopes.
    fn set_incoming_handler(&self, handler: IncomingHandler);

    /// Current operational status.
    fn status(&self) -> TransportStatus;

    /// Tears the transport down.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// Establishes a connection to a peer, for connection-oriented
    /// transports.
    async fn connect(&self, _peer: &PeerId) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!(
            "{}: connect",
            self.name()
        )))
    }

    /// Closes the connection to a peer.
    async fn disconnect(&self, _peer: &PeerId) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!(
            "{}: disconnect",
            self.name()
        )))
    }

    /// Whether [`Transport::discover_peers`] is implemented.
    fn supports_discovery(&self) -> bool {
        false
    }

    /// Surfaces peer candidates visible to this transport.
    async fn discover_peers(&self) -> Result<Vec<DiscoveredPeer>, TransportError> {
        Err(TransportError::Unsupported(format!(
            "{}: discover_peers",
            self.name()
        )))
    }
}
