//! Application assembly: wires the store, blob tree, transports,
//! services, gateway, and HTTP state together.

use std::sync::Arc;

use firma_sign_proto::ids::PeerId;

use crate::blob::{BlobStore, BlobStoreOptions};
use crate::config::ServerConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::http::{AppState, RateLimiter};
use crate::services::documents::DocumentService;
use crate::services::groups::GroupService;
use crate::services::messages::MessageService;
use crate::services::peers::PeerService;
use crate::services::transfers::{RetryPolicy, TransferRouter};
use crate::transport::channel::ChannelTransport;
use crate::transport::registry::TransportRegistry;
use crate::transport::Transport;
use crate::ws::auth::{JwtVerifier, NoSessions, SessionValidator};
use crate::ws::gateway::Gateway;

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Database open or migration failed.
    #[error("database startup failed: {0}")]
    Database(#[from] crate::db::StoreError),

    /// The blob root could not be prepared.
    #[error("blob store startup failed: {0}")]
    Blob(#[from] crate::blob::BlobError),
}

/// Builds the full application state.
///
/// Must run inside a tokio runtime: the gateway's forwarder and
/// keep-alive loops are spawned here, and the built-in `web` transport
/// gets its incoming handler wired to the transfer router.
///
/// # Errors
///
/// Returns [`BootstrapError`] when the database or blob store cannot
/// come up; both are fatal.
pub fn bootstrap(
    config: &ServerConfig,
    sessions: Arc<dyn SessionValidator>,
) -> Result<Arc<AppState>, BootstrapError> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).map_err(crate::blob::BlobError::from)?;
    }
    let db = Arc::new(Database::open(&config.db_path)?);
    let blob = Arc::new(BlobStore::new(
        config.blob_root(),
        BlobStoreOptions {
            max_file_size: config.max_file_size,
            use_checksum: true,
        },
    )?);

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(TransportRegistry::new());
    let local_peer = PeerId::new(&config.peer_id);

    let documents = Arc::new(DocumentService::new(Arc::clone(&db), Arc::clone(&blob)));
    let transfer_router = Arc::new(TransferRouter::new(
        Arc::clone(&db),
        Arc::clone(&documents),
        Arc::clone(&registry),
        Arc::clone(&bus),
        local_peer.clone(),
        RetryPolicy::default(),
    ));
    let messages = Arc::new(MessageService::new(
        Arc::clone(&db),
        Arc::clone(&bus),
        local_peer.clone(),
    ));
    let groups = Arc::new(GroupService::new(
        Arc::clone(&db),
        Arc::clone(&bus),
        Arc::clone(&messages),
        Arc::clone(&transfer_router),
    ));
    let peers = Arc::new(PeerService::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&bus),
        Arc::clone(&transfer_router),
        local_peer,
    ));

    // The built-in web channel: outbound envelopes surface through the
    // gateway's event stream, inbound ones land in the router.
    let (web, mut web_outbox) = ChannelTransport::create("web");
    {
        let router = Arc::clone(&transfer_router);
        web.set_incoming_handler(Arc::new(move |envelope| {
            if let Err(e) = router.receive_envelope(&envelope) {
                tracing::warn!(transfer = %envelope.transfer_id, error = %e, "failed to ingest incoming envelope");
            }
        }));
    }
    registry.register(web);
    tokio::spawn(async move {
        while let Some(envelope) = web_outbox.recv().await {
            tracing::debug!(
                transfer = %envelope.transfer_id,
                to = %envelope.to,
                "web envelope delivered to event stream"
            );
        }
    });

    let gateway = Arc::new(Gateway::new(
        JwtVerifier::new(&config.jwt_secret),
        sessions,
        Arc::clone(&messages),
        Arc::clone(&bus),
    ));
    gateway.start();

    Ok(Arc::new(AppState {
        db,
        registry,
        bus,
        documents,
        messages,
        groups,
        peers,
        transfer_router,
        gateway,
        rate_limiter: RateLimiter::default(),
    }))
}

/// Builds state with the default (reject-all) session validator.
///
/// # Errors
///
/// Returns [`BootstrapError`] when the database or blob store cannot
/// come up.
pub fn bootstrap_default(config: &ServerConfig) -> Result<Arc<AppState>, BootstrapError> {
    bootstrap(config, Arc::new(NoSessions))
}
