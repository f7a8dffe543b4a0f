//! In-process channel-backed transport.
//!
//! Backs the `web` channel and stands in for the external transports in
//! tests. Outbound envelopes land in an unbounded channel whose receiver
//! the test (or the gateway) drains; inbound envelopes are injected with
//! [`ChannelTransport::inject_incoming`]. Failure injection lets the
//! router's retry path be exercised deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use firma_sign_proto::transfer::Envelope;

use super::{IncomingHandler, Transport, TransportError, TransportStatus};

/// Failure the transport should report for upcoming sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Report [`TransportError::Transient`].
    Transient,
    /// Report [`TransportError::Permanent`].
    Permanent,
}

/// In-process transport backed by `tokio::sync::mpsc` channels.
pub struct ChannelTransport {
    name: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    status: Mutex<TransportStatus>,
    handler: Mutex<Option<IncomingHandler>>,
    /// Number of upcoming sends that should fail, and how.
    failures: Mutex<Option<InjectedFailure>>,
    remaining_failures: AtomicU32,
    sent_count: AtomicU32,
}

impl ChannelTransport {
    /// Creates a transport with the given name, returning the endpoint
    /// and the receiver its outbound envelopes arrive on.
    #[must_use]
    pub fn create(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            name: name.into(),
            outbound: tx,
            status: Mutex::new(TransportStatus::Uninitialized),
            handler: Mutex::new(None),
            failures: Mutex::new(None),
            remaining_failures: AtomicU32::new(0),
            sent_count: AtomicU32::new(0),
        });
        (transport, rx)
    }

    /// Arms failure injection: the next `count` sends fail as `failure`.
    pub fn fail_next(&self, failure: InjectedFailure, count: u32) {
        *self.failures.lock() = Some(failure);
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Number of envelopes successfully handed off.
    #[must_use]
    pub fn sent_count(&self) -> u32 {
        self.sent_count.load(Ordering::SeqCst)
    }

    /// Feeds an inbound envelope to the registered handler, as a real
    /// transport would on receipt.
    pub fn inject_incoming(&self, envelope: Envelope) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(envelope);
        } else {
            tracing::warn!(transport = %self.name, "incoming envelope dropped: no handler");
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _config: serde_json::Value) -> Result<(), TransportError> {
        *self.status.lock() = TransportStatus::Active;
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.status().is_active() {
            return Err(TransportError::Unavailable(self.name.clone()));
        }
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            let failure = self.failures.lock().unwrap_or(InjectedFailure::Transient);
            return Err(match failure {
                InjectedFailure::Transient => {
                    TransportError::Transient("injected transient failure".into())
                }
                InjectedFailure::Permanent => {
                    TransportError::Permanent("injected permanent failure".into())
                }
            });
        }
        self.outbound
            .send(envelope.clone())
            .map_err(|_| TransportError::Transient("outbound channel closed".into()))?;
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_incoming_handler(&self, handler: IncomingHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn status(&self) -> TransportStatus {
        self.status.lock().clone()
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        *self.status.lock() = TransportStatus::Shutdown;
        Ok(())
    }

    async fn connect(&self, _peer: &firma_sign_proto::ids::PeerId) -> Result<(), TransportError> {
        if self.status().is_active() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(self.name.clone()))
        }
    }

    async fn disconnect(
        &self,
        _peer: &firma_sign_proto::ids::PeerId,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firma_sign_proto::ids::TransferId;
    use firma_sign_proto::transfer::{SenderInfo, TransferMetadata};

    fn envelope(to: &str) -> Envelope {
        Envelope {
            transfer_id: TransferId::new("transfer-1-abc"),
            to: to.into(),
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
    async fn send_requires_initialization() {
        let (transport, _rx) = ChannelTransport::create("web");
        let err = transport.send(&envelope("bob")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (transport, mut rx) = ChannelTransport::create("web");
        transport.initialize(serde_json::Value::Null).await.unwrap();
        transport.send(&envelope("bob")).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.to, "bob");
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_expire_after_count() {
        let (transport, mut rx) = ChannelTransport::create("web");
        transport.initialize(serde_json::Value::Null).await.unwrap();
        transport.fail_next(InjectedFailure::Transient, 2);

        assert!(transport.send(&envelope("bob")).await.unwrap_err().is_transient());
        assert!(transport.send(&envelope("bob")).await.unwrap_err().is_transient());
        transport.send(&envelope("bob")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn incoming_handler_receives_injections() {
        let (transport, _rx) = ChannelTransport::create("web");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_incoming_handler(Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        }));
        transport.inject_incoming(envelope("self"));
        assert_eq!(rx.recv().await.unwrap().to, "self");
    }

    #[tokio::test]
    async fn shutdown_makes_transport_unavailable() {
        let (transport, _rx) = ChannelTransport::create("web");
        transport.initialize(serde_json::Value::Null).await.unwrap();
        transport.shutdown().await.unwrap();
        assert!(!transport.status().is_active());
        let err = transport.send(&envelope("bob")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }
}
