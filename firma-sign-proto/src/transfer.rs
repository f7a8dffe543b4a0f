//! Transfer, document, and recipient domain types.
//!
//! These types model the lifecycle of a transfer: a unit of work that
//! sends one or more documents to one or more recipients over one or more
//! transports. Status enums carry their legal transitions so services
//! never hand-roll state machine checks.

use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, TransferId, Timestamp};

/// Direction of a transfer relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferType {
    /// A transfer received from a remote peer.
    Incoming,
    /// A transfer created locally and sent out.
    Outgoing,
}

impl TransferType {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    /// Parses a transfer type from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// Lifecycle state of a transfer.
///
/// Legal forward path: `pending → ready → partially-signed → completed`.
/// `cancelled` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    /// Created; not all recipients have been notified yet.
    Pending,
    /// Every recipient has been notified.
    Ready,
    /// At least one document carries a signature.
    PartiallySigned,
    /// Every document is signed or rejected (and, when required, every
    /// recipient has signed). Terminal.
    Completed,
    /// Cancelled by the creator. Terminal.
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` if a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        if *self == next {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::Ready => *self == Self::Pending,
            Self::PartiallySigned => matches!(self, Self::Pending | Self::Ready),
            Self::Completed => matches!(self, Self::Pending | Self::Ready | Self::PartiallySigned),
            Self::Cancelled => !self.is_terminal(),
        }
    }

    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::PartiallySigned => "partially-signed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a transfer status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "partially-signed" => Some(Self::PartiallySigned),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    /// Stored but not yet attached to an active transfer.
    Draft,
    /// Waiting for signatures.
    Pending,
    /// Signing has begun.
    InProgress,
    /// Signed by a recipient.
    Signed,
    /// All signing activity finished.
    Completed,
    /// Moved to the archive tree.
    Archived,
    /// Soft-deleted; bytes may still exist until a hard delete.
    Deleted,
    /// Rejected by a recipient.
    Rejected,
}

impl DocumentStatus {
    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Signed => "signed",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
            Self::Rejected => "rejected",
        }
    }

    /// Parses a document status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "in-progress" => Some(Self::InProgress),
            "signed" => Some(Self::Signed),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Returns `true` when the document counts toward transfer completion.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Signed | Self::Rejected)
    }
}

/// Storage category a document's bytes live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentCategory {
    /// Uploaded locally, not yet sent.
    Uploaded,
    /// Received from a remote peer.
    Received,
    /// Sent to remote peers.
    Sent,
    /// Carrying at least one signature.
    Signed,
    /// Archived.
    Archived,
}

impl DocumentCategory {
    /// All categories, in the order the document lookup probes them.
    pub const ALL: [Self; 5] = [
        Self::Uploaded,
        Self::Received,
        Self::Sent,
        Self::Signed,
        Self::Archived,
    ];

    /// Returns the canonical lower-case name (also the directory name).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Signed => "signed",
            Self::Archived => "archived",
        }
    }

    /// Parses a category from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(Self::Uploaded),
            "received" => Some(Self::Received),
            "sent" => Some(Self::Sent),
            "signed" => Some(Self::Signed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Lifecycle state of a transfer recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipientStatus {
    /// Created; not yet notified over any transport.
    Pending,
    /// Notified over a transport.
    Notified,
    /// Opened the transfer.
    Viewed,
    /// Actively signing.
    Signing,
    /// Finished signing.
    Signed,
    /// Rejected the transfer.
    Rejected,
}

impl RecipientStatus {
    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Notified => "notified",
            Self::Viewed => "viewed",
            Self::Signing => "signing",
            Self::Signed => "signed",
            Self::Rejected => "rejected",
        }
    }

    /// Parses a recipient status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "notified" => Some(Self::Notified),
            "viewed" => Some(Self::Viewed),
            "signing" => Some(Self::Signing),
            "signed" => Some(Self::Signed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Free-form metadata attached to a transfer.
///
/// The core validates only the fields it consumes; everything else rides
/// along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Optional signing deadline (millis since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Timestamp>,
    /// Optional human message shown to recipients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When set, every recipient must sign before the transfer completes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub require_all_signatures: bool,
    /// Pass-through payload the core never interprets.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Snapshot of the sending peer embedded in a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    /// Sender's peer id.
    pub sender_id: String,
    /// Display name at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Transport the transfer arrived on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

/// A document carried inside a transport envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeDocument {
    /// Document id.
    pub id: DocumentId,
    /// Original file name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the document bytes, lower-case hex.
    pub hash: String,
    /// Inline content (base64), for transports that deliver bytes with
    /// the envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// The payload handed to a transport for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The transfer being delivered.
    pub transfer_id: TransferId,
    /// Recipient's transport-specific address.
    pub to: String,
    /// Documents in the transfer.
    pub documents: Vec<EnvelopeDocument>,
    /// Snapshot of the sender.
    pub sender: SenderInfo,
    /// Transfer metadata, passed through verbatim.
    pub metadata: TransferMetadata,
}
