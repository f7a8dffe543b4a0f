//! Peer, connection, and group membership domain types.

use serde::{Deserialize, Serialize};

/// Presence of a peer as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    /// Currently reachable.
    Online,
    /// Not reachable.
    Offline,
    /// Reachable but idle.
    Away,
}

impl PresenceStatus {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
        }
    }

    /// Parses a presence status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "away" => Some(Self::Away),
            _ => None,
        }
    }
}

/// How much the local node trusts a peer's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    /// Never verified.
    Unverified,
    /// Seen before; identity plausible.
    Known,
    /// Identity verified out of band.
    Verified,
}

impl TrustLevel {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Known => "known",
            Self::Verified => "verified",
        }
    }

    /// Parses a trust level from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unverified" => Some(Self::Unverified),
            "known" => Some(Self::Known),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

/// Direction of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionDirection {
    /// Initiated by the remote peer.
    Inbound,
    /// Initiated locally.
    Outbound,
}

impl ConnectionDirection {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parses a direction from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// State of a peer connection over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    /// Handshake in progress.
    Connecting,
    /// Established.
    Connected,
    /// Closed normally.
    Disconnected,
    /// Closed with an error.
    Failed,
}

impl ConnectionStatus {
    /// Returns `true` while the connection row counts as open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Parses a connection status from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Role of a peer within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupRole {
    /// May manage membership and settings.
    Admin,
    /// Regular member.
    Member,
}

impl GroupRole {
    /// Returns the canonical lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    /// Parses a role from its canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// Per-group behavior settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSettings {
    /// Whether non-admin members may invite peers.
    pub allow_member_invites: bool,
    /// Whether messages in this group must be encrypted.
    pub require_encryption: bool,
    /// Transport used when a send request does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_transport: Option<String>,
}
