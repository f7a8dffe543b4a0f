//! Peer service: directory, discovery aggregation, connect and
//! disconnect, and per-peer transfer history.

use std::sync::Arc;

use serde::Serialize;

use firma_sign_proto::ids::PeerId;
use firma_sign_proto::peer::{ConnectionDirection, ConnectionStatus, PresenceStatus, TrustLevel};

use crate::db::peers::{NewPeer, PeerIdentifierRow, PeerRow};
use crate::db::recipients::RecipientPreferences;
use crate::db::transfers::TransferRow;
use crate::db::{Database, connections, peers, transfers};
use crate::error::ApiError;
use crate::events::{Event, EventBus};
use crate::services::transfers::{
    CreateTransferRequest, CreatedTransfer, TransferDocument, TransferRecipient, TransferRouter,
};
use crate::transport::registry::TransportRegistry;

/// Filter for [`PeerService::discover`].
#[derive(Debug, Clone, Default)]
pub struct DiscoverFilter {
    /// Restrict discovery to these transports.
    pub transports: Option<Vec<String>>,
    /// Case-insensitive substring of the display name or identifier.
    pub query: Option<String>,
    /// Only peers currently online.
    pub online_only: bool,
    /// Only peers with verified trust.
    pub verified_only: bool,
}

/// A discovered or known peer, merged from transports and the local
/// directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    /// Stable peer id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Display name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Presence, for directory peers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    /// Trust level, for directory peers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    /// Transports the peer is reachable on.
    pub transports: Vec<String>,
}

/// Transfer history counts for a peer.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCounts {
    /// Outgoing transfers addressed to the peer.
    pub sent: u32,
    /// Incoming transfers from the peer.
    pub received: u32,
}

/// Full peer details.
#[derive(Debug)]
pub struct PeerDetails {
    /// The directory row.
    pub peer: PeerRow,
    /// Per-transport identifiers.
    pub identifiers: Vec<PeerIdentifierRow>,
    /// Transfer history counts.
    pub transfers: TransferCounts,
}

/// Options for [`PeerService::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Transport to try first.
    pub transport: String,
    /// Transports to walk, in order, when the first fails.
    pub fallback_transports: Vec<String>,
}

/// Outcome of a successful connect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOutcome {
    /// The transport that connected.
    pub transport: String,
    /// Always `connected`.
    pub status: String,
}

/// Directory and connection management for peers.
pub struct PeerService {
    db: Arc<Database>,
    registry: Arc<TransportRegistry>,
    bus: Arc<EventBus>,
    router: Arc<TransferRouter>,
    local_peer: PeerId,
}

impl PeerService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        registry: Arc<TransportRegistry>,
        bus: Arc<EventBus>,
        router: Arc<TransferRouter>,
        local_peer: PeerId,
    ) -> Self {
        Self {
            db,
            registry,
            bus,
            router,
            local_peer,
        }
    }

    /// Inserts a peer into the directory.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] for a duplicate id.
    pub fn register_peer(&self, peer: &NewPeer) -> Result<(), ApiError> {
        self.db.with_conn(|conn| peers::insert(conn, peer))?;
        Ok(())
    }

    /// Attaches a per-transport identifier to a peer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] when the (transport, identifier)
    /// pair is already claimed.
    pub fn add_identifier(
        &self,
        peer_id: &PeerId,
        transport: &str,
        identifier: &str,
        verified: bool,
    ) -> Result<(), ApiError> {
        self.db
            .with_conn(|conn| peers::add_identifier(conn, peer_id, transport, identifier, verified))?;
        Ok(())
    }

    /// Aggregates peer candidates from every discovery-capable
    /// transport and merges them with the local directory.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub async fn discover(&self, filter: &DiscoverFilter) -> Result<Vec<PeerSummary>, ApiError> {
        let discovered = self.registry.discover_peers().await;
        let local = self.db.with_conn(peers::list)?;

        let query = filter.query.as_ref().map(|q| q.to_lowercase());
        let mut summaries: Vec<PeerSummary> = Vec::new();

        for peer in local {
            if filter.online_only && peer.status != PresenceStatus::Online {
                continue;
            }
            if filter.verified_only && peer.trust_level != TrustLevel::Verified {
                continue;
            }
            let identifiers = self
                .db
                .with_conn(|conn| peers::identifiers(conn, &peer.id))?;
            if let Some(query) = &query
                && !peer.display_name.to_lowercase().contains(query)
                && !peer.id.as_str().to_lowercase().contains(query)
                && !identifiers
                    .iter()
                    .any(|i| i.identifier.to_lowercase().contains(query))
            {
                continue;
            }
            summaries.push(PeerSummary {
                peer_id: Some(peer.id.to_string()),
                display_name: Some(peer.display_name.clone()),
                status: Some(peer.status),
                trust_level: Some(peer.trust_level),
                transports: identifiers.into_iter().map(|i| i.transport).collect(),
            });
        }

        for candidate in discovered {
            if let Some(allowed) = &filter.transports
                && !allowed.contains(&candidate.transport)
            {
                continue;
            }
            if let Some(query) = &query
                && !candidate.identifier.to_lowercase().contains(query)
                && !candidate
                    .display_name
                    .as_ref()
                    .is_some_and(|n| n.to_lowercase().contains(query))
            {
                continue;
            }
            // Skip candidates already represented by a directory entry.
            if candidate
                .peer_id
                .as_ref()
                .is_some_and(|id| summaries.iter().any(|s| s.peer_id.as_deref() == Some(id)))
            {
                continue;
            }
            summaries.push(PeerSummary {
                peer_id: candidate.peer_id,
                display_name: candidate.display_name,
                status: None,
                trust_level: None,
                transports: vec![candidate.transport],
            });
        }

        Ok(summaries)
    }

    /// Loads a peer with its identifiers and transfer history counts.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown peer.
    pub fn get_details(&self, peer_id: &PeerId) -> Result<PeerDetails, ApiError> {
        let peer = self
            .db
            .with_conn(|conn| peers::find(conn, peer_id))?
            .ok_or_else(|| ApiError::not_found("peer", peer_id.as_str()))?;
        let identifiers = self.db.with_conn(|conn| peers::identifiers(conn, peer_id))?;

        let sent = self.transfers_sent_to(peer_id, &identifiers)?;
        let received = self
            .db
            .with_conn(|conn| transfers::find_received_from_sender(conn, peer_id.as_str()))?;

        Ok(PeerDetails {
            peer,
            identifiers,
            transfers: TransferCounts {
                sent: u32::try_from(sent.len()).unwrap_or(u32::MAX),
                received: u32::try_from(received.len()).unwrap_or(u32::MAX),
            },
        })
    }

    fn transfers_sent_to(
        &self,
        peer_id: &PeerId,
        identifiers: &[PeerIdentifierRow],
    ) -> Result<Vec<TransferRow>, ApiError> {
        let mut addresses: Vec<String> = vec![peer_id.as_str().to_string()];
        addresses.extend(identifiers.iter().map(|i| i.identifier.clone()));
        Ok(self
            .db
            .with_conn(|conn| transfers::find_sent_to_identifiers(conn, &addresses))?)
    }

    /// Connects to a peer: the requested transport first, then each
    /// fallback in order. Success records exactly one open connection
    /// row and emits `peer:connected`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown peer and
    /// [`ApiError::ConnectionFailed`] when every transport fails.
    pub async fn connect(
        &self,
        peer_id: &PeerId,
        options: &ConnectOptions,
    ) -> Result<ConnectOutcome, ApiError> {
        self.db
            .with_conn(|conn| peers::find(conn, peer_id))?
            .ok_or_else(|| ApiError::not_found("peer", peer_id.as_str()))?;

        let mut attempts = vec![options.transport.clone()];
        for fallback in &options.fallback_transports {
            if !attempts.contains(fallback) {
                attempts.push(fallback.clone());
            }
        }

        let mut last_error = String::from("no transport attempted");
        for name in &attempts {
            if !self.registry.is_active(name) {
                last_error = format!("transport {name} is not active");
                continue;
            }
            let Some(transport) = self.registry.get(name) else {
                last_error = format!("transport {name} is not registered");
                continue;
            };
            match transport.connect(peer_id).await {
                Ok(()) => {
                    self.db.with_conn(|conn| {
                        connections::open(
                            conn,
                            &self.local_peer,
                            peer_id,
                            name,
                            ConnectionDirection::Outbound,
                        )
                        .map(|_| ())
                    })?;
                    self.db.with_conn(|conn| {
                        peers::set_presence(conn, peer_id, PresenceStatus::Online)
                    })?;
                    self.bus.publish(&Event::PeerConnected {
                        peer_id: peer_id.to_string(),
                        transport: name.clone(),
                    });
                    return Ok(ConnectOutcome {
                        transport: name.clone(),
                        status: "connected".to_string(),
                    });
                }
                Err(e) => {
                    tracing::debug!(peer = %peer_id, transport = %name, error = %e, "connect attempt failed");
                    // No open row may survive a failed attempt.
                    self.db.with_conn(|conn| {
                        connections::close(
                            conn,
                            &self.local_peer,
                            peer_id,
                            name,
                            ConnectionStatus::Failed,
                        )
                        .map(|_| ())
                    })?;
                    last_error = e.to_string();
                }
            }
        }
        Err(ApiError::ConnectionFailed(last_error))
    }

    /// Disconnects every open connection to a peer and emits
    /// `peer:disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown peer.
    pub async fn disconnect(&self, peer_id: &PeerId) -> Result<(), ApiError> {
        self.db
            .with_conn(|conn| peers::find(conn, peer_id))?
            .ok_or_else(|| ApiError::not_found("peer", peer_id.as_str()))?;

        let open = self
            .db
            .with_conn(|conn| connections::open_for_peer(conn, peer_id))?;
        for row in open {
            if let Some(transport) = self.registry.get(&row.transport) {
                // Transports without connection support just skip this.
                if let Err(e) = transport.disconnect(peer_id).await {
                    tracing::debug!(peer = %peer_id, transport = %row.transport, error = %e, "transport disconnect failed");
                }
            }
            self.db.with_conn(|conn| {
                connections::close(
                    conn,
                    &row.local_peer,
                    peer_id,
                    &row.transport,
                    ConnectionStatus::Disconnected,
                )
                .map(|_| ())
            })?;
            self.bus.publish(&Event::PeerDisconnected {
                peer_id: peer_id.to_string(),
                transport: row.transport.clone(),
            });
        }
        self.db
            .with_conn(|conn| peers::set_presence(conn, peer_id, PresenceStatus::Offline))?;
        Ok(())
    }

    /// Sends documents to a peer as a new transfer, resolving the
    /// peer's address for the chosen transport.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown peer.
    pub async fn send_transfer(
        &self,
        peer_id: &PeerId,
        documents: Vec<TransferDocument>,
        transport: String,
        fallback_transports: Vec<String>,
    ) -> Result<CreatedTransfer, ApiError> {
        self.db
            .with_conn(|conn| peers::find(conn, peer_id))?
            .ok_or_else(|| ApiError::not_found("peer", peer_id.as_str()))?;
        let identifiers = self.db.with_conn(|conn| peers::identifiers(conn, peer_id))?;
        let identifier = identifiers
            .iter()
            .find(|i| i.transport == transport)
            .map_or_else(|| peer_id.as_str().to_string(), |i| i.identifier.clone());

        let created = self.router.create_transfer(&CreateTransferRequest {
            documents,
            recipients: vec![TransferRecipient {
                identifier,
                transport: transport.clone(),
                preferences: RecipientPreferences {
                    fallback_transports,
                    notification_enabled: true,
                },
            }],
            metadata: firma_sign_proto::transfer::TransferMetadata::default(),
            transport: Some(transport),
        })?;

        // The dispatch runs on the request path: dropping this future
        // (client disconnect, request deadline) drops the guard, which
        // cancels the scope and stops the retry loop. The transfer
        // itself stays durable and resumes on the next startup.
        let cancel = self.router.cancellation_scope();
        let _abort_on_drop = cancel.clone().drop_guard();
        self.router
            .dispatch_with_cancel(
                &firma_sign_proto::ids::TransferId::new(created.transfer_id.clone()),
                &cancel,
            )
            .await?;
        Ok(created)
    }

    /// Lists transfers involving a peer. `direction` is `sent`,
    /// `received`, or `None` for both.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown peer.
    pub fn get_peer_transfers(
        &self,
        peer_id: &PeerId,
        direction: Option<&str>,
    ) -> Result<Vec<TransferRow>, ApiError> {
        let identifiers = self.db.with_conn(|conn| peers::identifiers(conn, peer_id))?;
        let mut result = Vec::new();
        if direction.is_none() || direction == Some("sent") {
            result.extend(self.transfers_sent_to(peer_id, &identifiers)?);
        }
        if direction.is_none() || direction == Some("received") {
            result.extend(self.db.with_conn(|conn| {
                transfers::find_received_from_sender(conn, peer_id.as_str())
            })?);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }
}
