//! WebSocket gateway core: socket lifecycle, frame dispatch, and
//! bus-to-socket event forwarding.
//!
//! Connection lifecycle:
//! 1. The connection registers in the [`ClientRegistry`].
//! 2. A writer task forwards queued frames to the socket.
//! 3. The reader loop dispatches JSON frames by `type`; everything but
//!    `auth` requires authentication first.
//! 4. On disconnect the client is unregistered.
//!
//! A background forwarder drains the event bus and fans each event out
//! to the clients in its scope; a keep-alive loop pings every 30s and
//! closes clients idle beyond 5 minutes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use firma_sign_proto::ids::{PeerId, Timestamp};
use firma_sign_proto::ws::{ClientFrame, ServerFrame, decode_client, encode_server};

use crate::events::{EventBus, Scope};
use crate::services::messages::{MessageService, SendMessageOptions};
use crate::ws::auth::{JwtVerifier, SessionValidator};
use crate::ws::clients::ClientRegistry;

/// Keep-alive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Idle cutoff before a client is closed.
const MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// The gateway's shared state.
pub struct Gateway {
    clients: ClientRegistry,
    verifier: JwtVerifier,
    sessions: Arc<dyn SessionValidator>,
    messages: Arc<MessageService>,
    bus: Arc<EventBus>,
}

impl Gateway {
    /// Creates the gateway.
    #[must_use]
    pub fn new(
        verifier: JwtVerifier,
        sessions: Arc<dyn SessionValidator>,
        messages: Arc<MessageService>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            clients: ClientRegistry::new(),
            verifier,
            sessions,
            messages,
            bus,
        }
    }

    /// The client registry (exposed for tests and metrics).
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Spawns the event forwarder and keep-alive loops.
    pub fn start(self: &Arc<Self>) {
        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            let mut stream = forwarder.bus.subscribe();
            while let Some(event) = stream.recv().await {
                forwarder.forward_event(&event);
            }
        });

        let keepalive = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PING_INTERVAL);
            loop {
                tick.tick().await;
                keepalive.ping_and_sweep();
            }
        });
    }

    /// Fans one bus event out to the clients in its scope.
    fn forward_event(&self, event: &crate::events::Event) {
        let scope = event.scope();
        let (transfer_id, peer_id, group_id) = match &scope {
            Scope::Transfer(id) => (Some(id.clone()), None, None),
            Scope::Peer(id) => (None, Some(id.clone()), None),
            Scope::Group(id) => (None, None, Some(id.clone())),
            Scope::Broadcast => (None, None, None),
        };
        let frame = ServerFrame::Event {
            event: event.name().to_string(),
            transfer_id: transfer_id.clone(),
            peer_id: peer_id.clone(),
            group_id: group_id.clone(),
            data: event.payload(),
            timestamp: Timestamp::now(),
        };
        let Ok(text) = encode_server(&frame) else {
            return;
        };

        let targets = self.clients.snapshot_matching(|client| match &scope {
            Scope::Transfer(id) => client.transfers.contains(id),
            Scope::Peer(id) => client.peers.contains(id),
            Scope::Group(id) => client.groups.contains(id),
            Scope::Broadcast => true,
        });
        for target in targets {
            if !target.send(text.clone()) {
                tracing::debug!(client = target.id, "event frame dropped: writer gone");
            }
        }
    }

    /// Sends a ping to every client and closes idle ones.
    fn ping_and_sweep(&self) {
        let ping = encode_server(&ServerFrame::Ping {
            timestamp: Timestamp::now(),
        });
        if let Ok(text) = ping {
            for client in self.clients.snapshot_matching(|_| true) {
                let _ = client.send(text.clone());
            }
        }
        for id in self.clients.sweep_idle(MAX_IDLE) {
            tracing::info!(client = id, "closed idle client");
        }
    }

    /// Handles one upgraded WebSocket connection.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (client_id, mut outbound) = self.clients.register();
        tracing::info!(client = client_id, "websocket client connected");

        let mut write_task = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let reader = Arc::clone(&self);
        let mut read_task = tokio::spawn(async move {
            while let Some(Ok(message)) = ws_receiver.next().await {
                match message {
                    Message::Text(text) => {
                        reader.clients.touch(client_id);
                        reader.handle_frame(client_id, text.as_str());
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        reader.clients.touch(client_id);
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        reader.send_error(client_id, "binary frames are not supported");
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut read_task => write_task.abort(),
            _ = &mut write_task => read_task.abort(),
        }

        self.clients.unregister(client_id);
        tracing::info!(client = client_id, "websocket client disconnected");
    }

    /// Dispatches one client frame.
    fn handle_frame(&self, client_id: u64, text: &str) {
        let frame = match decode_client(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(client = client_id, error = %e, "undecodable frame");
                self.send_error(client_id, "malformed frame");
                return;
            }
        };

        match frame {
            ClientFrame::Auth { token, session_id } => {
                self.handle_auth(client_id, token.as_deref(), session_id.as_deref());
            }
            ClientFrame::Pong => {}
            frame if !self.clients.is_authenticated(client_id) => {
                tracing::debug!(client = client_id, ?frame, "frame before authentication");
                self.send_error(client_id, "Not authenticated");
            }
            ClientFrame::Subscribe { transfer_id } => {
                self.clients
                    .set_transfer_subscription(client_id, &transfer_id, true);
                // Transfer subscribers also receive peer-scoped events
                // addressed to the same id.
                self.clients
                    .set_peer_subscription(client_id, &transfer_id, true);
                self.send_frame(
                    client_id,
                    &ServerFrame::Subscribed {
                        transfer_id,
                        timestamp: Timestamp::now(),
                    },
                );
            }
            ClientFrame::Unsubscribe { transfer_id } => {
                self.clients
                    .set_transfer_subscription(client_id, &transfer_id, false);
                self.clients
                    .set_peer_subscription(client_id, &transfer_id, false);
                self.send_frame(
                    client_id,
                    &ServerFrame::Unsubscribed {
                        transfer_id,
                        timestamp: Timestamp::now(),
                    },
                );
            }
            ClientFrame::JoinGroup { group_id } => {
                self.clients.set_group_membership(client_id, &group_id, true);
                self.send_frame(
                    client_id,
                    &ServerFrame::JoinedGroup {
                        group_id,
                        timestamp: Timestamp::now(),
                    },
                );
            }
            ClientFrame::LeaveGroup { group_id } => {
                self.clients
                    .set_group_membership(client_id, &group_id, false);
                self.send_frame(
                    client_id,
                    &ServerFrame::LeftGroup {
                        group_id,
                        timestamp: Timestamp::now(),
                    },
                );
            }
            ClientFrame::Message {
                peer_id,
                content,
                transport,
            } => match self.messages.send(
                &PeerId::new(&peer_id),
                SendMessageOptions {
                    content,
                    message_type: firma_sign_proto::message::MessageType::Text,
                    transport,
                    attachments: Vec::new(),
                    encrypted: false,
                },
            ) {
                Ok(receipt) => {
                    self.send_frame(
                        client_id,
                        &ServerFrame::MessageSent {
                            message_id: receipt.message_id,
                            peer_id,
                            status: receipt.status,
                            timestamp: Timestamp::now(),
                        },
                    );
                }
                Err(e) => self.send_error(client_id, &e.to_string()),
            },
        }
    }

    fn handle_auth(&self, client_id: u64, token: Option<&str>, session_id: Option<&str>) {
        let user = token
            .and_then(|t| self.verifier.verify(t).ok())
            .or_else(|| session_id.and_then(|s| self.sessions.validate(s)));

        match user {
            Some(user) => {
                self.clients.authenticate(
                    client_id,
                    Some(user.user_id.clone()),
                    user.session_id.clone(),
                );
                tracing::info!(client = client_id, user = %user.user_id, "client authenticated");
                self.send_frame(
                    client_id,
                    &ServerFrame::AuthResult {
                        success: true,
                        session_id: user.session_id,
                        user_id: Some(user.user_id),
                        timestamp: Timestamp::now(),
                    },
                );
            }
            None => {
                tracing::debug!(client = client_id, "authentication failed");
                self.send_frame(
                    client_id,
                    &ServerFrame::AuthResult {
                        success: false,
                        session_id: None,
                        user_id: None,
                        timestamp: Timestamp::now(),
                    },
                );
            }
        }
    }

    fn send_frame(&self, client_id: u64, frame: &ServerFrame) {
        if let Ok(text) = encode_server(frame) {
            self.clients.send_to(client_id, text);
        }
    }

    fn send_error(&self, client_id: u64, error: &str) {
        self.send_frame(
            client_id,
            &ServerFrame::Error {
                error: error.to_string(),
                timestamp: Timestamp::now(),
            },
        );
    }
}
