//! Transport registry: named instances, status tracking, and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use firma_sign_proto::ids::PeerId;
use firma_sign_proto::transfer::Envelope;

use super::{DiscoveredPeer, Transport, TransportError, TransportStatus};

/// Owns the name → instance map and the parallel name → status map.
///
/// Registration order is preserved: `select_for_peer` returns the first
/// active transport in that order. A capability-weighted selection is a
/// future extension.
pub struct TransportRegistry {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    statuses: RwLock<HashMap<String, TransportStatus>>,
    order: RwLock<Vec<String>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a transport under its own name. Re-registering a name
    /// replaces the instance and resets its status.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        let mut order = self.order.write();
        if !order.contains(&name) {
            order.push(name.clone());
        }
        drop(order);
        self.transports.write().insert(name.clone(), transport);
        self.statuses
            .write()
            .insert(name, TransportStatus::Uninitialized);
    }

    /// Initializes each named transport with its config. A failing
    /// transport is recorded as [`TransportStatus::Error`] and does not
    /// stop the others.
    ///
    /// Returns the resulting status per requested name.
    pub async fn initialize(
        &self,
        names: &[String],
        configs: &HashMap<String, serde_json::Value>,
    ) -> Vec<(String, TransportStatus)> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let transport = self.transports.read().get(name).cloned();
            let status = match transport {
                Some(transport) => {
                    let config = configs
                        .get(name)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    match transport.initialize(config).await {
                        Ok(()) => {
                            tracing::info!(transport = %name, "transport initialized");
                            TransportStatus::Active
                        }
                        Err(e) => {
                            tracing::warn!(transport = %name, error = %e, "transport initialization failed");
                            TransportStatus::Error {
                                error: e.to_string(),
                            }
                        }
                    }
                }
                None => TransportStatus::Error {
                    error: format!("transport {name} is not registered"),
                },
            };
            self.statuses.write().insert(name.clone(), status.clone());
            results.push((name.clone(), status));
        }
        results
    }

    /// Returns the transport registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(name).cloned()
    }

    /// Returns the tracked status for `name`.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<TransportStatus> {
        self.statuses.read().get(name).cloned()
    }

    /// All registered names with their status, in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, TransportStatus)> {
        let order = self.order.read();
        let statuses = self.statuses.read();
        order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    statuses
                        .get(name)
                        .cloned()
                        .unwrap_or(TransportStatus::Uninitialized),
                )
            })
            .collect()
    }

    /// Names of transports currently active, in registration order.
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter(|(_, status)| status.is_active())
            .map(|(name, _)| name)
            .collect()
    }

    /// Whether `name` is registered and active.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.status(name).is_some_and(|s| s.is_active())
    }

    /// Picks a transport for a peer: the first active one.
    #[must_use]
    pub fn select_for_peer(&self, _peer: &PeerId) -> Option<String> {
        self.active_names().into_iter().next()
    }

    /// Dispatches an envelope via the named transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] for an unknown or
    /// inactive name, otherwise whatever the transport returns. No
    /// retries happen here.
    pub async fn send_via(&self, name: &str, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_active(name) {
            return Err(TransportError::Unavailable(name.to_string()));
        }
        let transport = self
            .get(name)
            .ok_or_else(|| TransportError::Unavailable(name.to_string()))?;
        transport.send(envelope).await
    }

    /// Collects discovery results from every active transport that
    /// supports discovery. Failures are logged and skipped.
    pub async fn discover_peers(&self) -> Vec<DiscoveredPeer> {
        let mut found = Vec::new();
        for name in self.active_names() {
            let Some(transport) = self.get(&name) else {
                continue;
            };
            if !transport.supports_discovery() {
                continue;
            }
            match transport.discover_peers().await {
                Ok(peers) => found.extend(peers),
                Err(e) => {
                    tracing::warn!(transport = %name, error = %e, "peer discovery failed");
                }
            }
        }
        found
    }

    /// Shuts every transport down, recording the outcome. Failures are
    /// isolated like initialization failures.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.order.read().clone();
        for name in names {
            let Some(transport) = self.get(&name) else {
                continue;
            };
            match transport.shutdown().await {
                Ok(()) => {
                    self.statuses
                        .write()
                        .insert(name.clone(), TransportStatus::Shutdown);
                }
                Err(e) => {
                    tracing::warn!(transport = %name, error = %e, "transport shutdown failed");
                    self.statuses.write().insert(
                        name.clone(),
                        TransportStatus::Error {
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::ChannelTransport;
    use firma_sign_proto::ids::TransferId;
    use firma_sign_proto::transfer::{SenderInfo, TransferMetadata};

    fn envelope() -> Envelope {
        Envelope {
            transfer_id: TransferId::new("transfer-1-abc"),
            to: "bob".into(),
            documents: vec![],
            sender: SenderInfo {
                sender_id: "self".into(),
                name: None,
                transport: None,
            },
            metadata: TransferMetadata::default(),
        }
    }

    #[tokio::test]
    async fn initialize_isolates_failures() {
        let registry = TransportRegistry::new();
        let (web, _rx) = ChannelTransport::create("web");
        registry.register(web);

        let results = registry
            .initialize(
                &["web".to_string(), "p2p".to_string()],
                &HashMap::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_active());
        assert!(matches!(results[1].1, TransportStatus::Error { .. }));
        // The failing transport did not prevent the healthy one.
        assert!(registry.is_active("web"));
    }

    #[tokio::test]
    async fn select_for_peer_returns_first_active() {
        let registry = TransportRegistry::new();
        let (p2p, _rx1) = ChannelTransport::create("p2p");
        let (email, _rx2) = ChannelTransport::create("email");
        registry.register(p2p);
        registry.register(email);

        // Only email initialized.
        registry
            .initialize(&["email".to_string()], &HashMap::new())
            .await;
        assert_eq!(
            registry.select_for_peer(&PeerId::new("bob")).as_deref(),
            Some("email")
        );

        // Once p2p comes up it wins by registration order.
        registry
            .initialize(&["p2p".to_string()], &HashMap::new())
            .await;
        assert_eq!(
            registry.select_for_peer(&PeerId::new("bob")).as_deref(),
            Some("p2p")
        );
    }

    #[tokio::test]
    async fn send_via_unknown_name_is_unavailable() {
        let registry = TransportRegistry::new();
        let err = registry.send_via("telegram", &envelope()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn send_via_dispatches_to_named_transport() {
        let registry = TransportRegistry::new();
        let (web, mut rx) = ChannelTransport::create("web");
        registry.register(web);
        registry
            .initialize(&["web".to_string()], &HashMap::new())
            .await;

        registry.send_via("web", &envelope()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_marks_all_transports() {
        let registry = TransportRegistry::new();
        let (web, _rx) = ChannelTransport::create("web");
        registry.register(web);
        registry
            .initialize(&["web".to_string()], &HashMap::new())
            .await;

        registry.shutdown_all().await;
        assert_eq!(registry.status("web"), Some(TransportStatus::Shutdown));
        assert!(registry.active_names().is_empty());
    }
}
