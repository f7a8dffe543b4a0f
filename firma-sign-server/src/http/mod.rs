//! HTTP API surface.
//!
//! Assembles the axum router under `/api`, the WebSocket endpoint at
//! `/ws`, and the per-IP rate limit middleware. [`start_server`]
//! returns the bound address and a join handle so tests can run
//! against an OS-assigned port.

pub mod dto;

mod connections;
mod groups;
mod peers;
mod transfers;
mod transports;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use parking_lot::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::db::Database;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::services::documents::DocumentService;
use crate::services::groups::GroupService;
use crate::services::messages::MessageService;
use crate::services::peers::PeerService;
use crate::services::transfers::TransferRouter;
use crate::transport::registry::TransportRegistry;
use crate::ws::Gateway;

/// Requests allowed per window per client IP.
const RATE_LIMIT_MAX: u32 = 100;

/// Rate limit window.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Implicit deadline applied to every API call. Hitting it drops the
/// handler future, which cancels any dispatch awaited on the request
/// path (the same propagation a client disconnect triggers).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sliding-window request counter per client IP.
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    counters: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW, RATE_LIMIT_MAX)
    }
}

impl RateLimiter {
    /// Creates a limiter with a custom window, for tests.
    #[must_use]
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request from `ip`, returning `false` once the window's
    /// budget is spent.
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut counters = self.counters.lock();
        let now = Instant::now();
        let entry = counters.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Shared application state handed to every handler.
pub struct AppState {
    /// Relational store.
    pub db: Arc<Database>,
    /// Transport registry.
    pub registry: Arc<TransportRegistry>,
    /// Internal event bus.
    pub bus: Arc<EventBus>,
    /// Document service.
    pub documents: Arc<DocumentService>,
    /// Message service.
    pub messages: Arc<MessageService>,
    /// Group service.
    pub groups: Arc<GroupService>,
    /// Peer service.
    pub peers: Arc<PeerService>,
    /// Transfer router.
    pub transfer_router: Arc<TransferRouter>,
    /// WebSocket gateway.
    pub gateway: Arc<Gateway>,
    /// API rate limiter.
    pub rate_limiter: RateLimiter,
}

async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.rate_limiter.check(addr.ip()) {
        next.run(request).await
    } else {
        tracing::warn!(ip = %addr.ip(), "rate limit exceeded");
        ApiError::RateLimited.into_response()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let gateway = Arc::clone(&state.gateway);
    ws.on_upgrade(move |socket| gateway.handle_socket(socket))
}

/// Builds the full router.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/connections/initialize", post(connections::initialize))
        .route("/connections/status", get(connections::status))
        .route("/peers/discover", post(peers::discover))
        .route("/peers/{id}", get(peers::get))
        .route("/peers/{id}/connect", post(peers::connect))
        .route("/peers/{id}/disconnect", post(peers::disconnect))
        .route(
            "/peers/{id}/transfers",
            post(peers::send_transfer).get(peers::list_transfers),
        )
        .route(
            "/peers/{id}/messages",
            post(peers::send_message).get(peers::list_messages),
        )
        .route("/peers/{id}/messages/read", post(peers::mark_read))
        .route("/groups", post(groups::create))
        .route("/groups/{id}", get(groups::get).delete(groups::delete))
        .route("/groups/{id}/members", get(groups::members).post(groups::add_member))
        .route("/groups/{id}/members/{peerId}", delete(groups::remove_member))
        .route("/groups/{id}/send", post(groups::send))
        .route("/transports/available", get(transports::available))
        .route("/transports/p2p/network", get(transports::p2p_network))
        .route("/transports/email/queue", get(transports::email_queue))
        .route("/transfers/create", post(transfers::create))
        .route("/transfers", get(transfers::list))
        .route("/transfers/{id}", get(transfers::get))
        .route("/transfers/{id}/sign", post(transfers::sign))
        .route(
            "/transfers/{id}/documents/{docId}",
            get(transfers::download_document),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    // The WebSocket endpoint is long-lived and stays outside the
    // request deadline.
    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Starts the server on the given address and returns the bound
/// address and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test
/// code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server(
    addr: &str,
    state: Arc<AppState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
