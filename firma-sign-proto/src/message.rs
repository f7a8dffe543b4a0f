//! Message domain types and the delivery state machine.
//!
//! A message advances monotonically through `pending → sent → delivered →
//! read`, with `failed` as a terminal sink from any non-terminal state.
//! [`MessageStatus::can_advance_to`] is the single authority on legal
//! transitions; repositories and services call it rather than re-encoding
//! the rules.

use serde::{Deserialize, Serialize};

use crate::ids::TransferId;

/// Kind of message carried between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Plain text.
    Text,
    /// File attachment message.
    File,
    /// Notification that a transfer was sent to the recipient.
    TransferNotification,
}

impl MessageType {
    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::TransferNotification => "transfer-notification",
        }
    }

    /// Parses a message type from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "file" => Some(Self::File),
            "transfer-notification" => Some(Self::TransferNotification),
            _ => None,
        }
    }
}

/// Direction of a message relative to the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageDirection {
    /// Received from a remote peer.
    Incoming,
    /// Sent by the local peer.
    Outgoing,
}

impl MessageDirection {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    /// Parses a direction from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    /// Created but not yet handed to a transport.
    Pending,
    /// Handed to a transport.
    Sent,
    /// Acknowledged by the recipient's transport.
    Delivered,
    /// Read by the recipient. Terminal.
    Read,
    /// Delivery failed. Terminal.
    Failed,
}

impl MessageStatus {
    /// Position in the monotonic chain; `failed` sits outside it.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Returns `true` if advancing from `self` to `next` is legal.
    ///
    /// Forward-only along `pending → sent → delivered → read`; `failed`
    /// is reachable from any non-terminal state.
    #[must_use]
    pub fn can_advance_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() > self.rank()
    }

    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Parses a message status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An attachment carried by a message: an inline file reference or a
/// pointer to a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Attachment {
    /// An inline file reference.
    #[serde(rename_all = "camelCase")]
    File {
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// SHA-256 of the bytes, lower-case hex.
        hash: String,
    },
    /// A reference to an existing transfer.
    #[serde(rename_all = "camelCase")]
    Transfer {
        /// The referenced transfer.
        transfer_id: TransferId,
    },
}
