//! Tablet gateway: HTTP + WebSocket server for connected clients.
//!
//! One axum server exposes `/status` and `/ws_bidirectional`. Each accepted
//! socket gets a registry entry and a writer task; inbound frames are parsed
//! and dispatched to the orchestrator as [`GatewayEvent`]s. A malformed frame
//! answers the offending client with a `system:error` frame and never kills
//! the receive loop.

pub mod protocol;

use crate::config::GatewayConfig;
use crate::error::{Result, UmebotError};
use crate::motion::GamepadPayload;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, SystemLevel};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use tracing::{debug, info, warn};

/// Registry id of one connected client.
pub type ClientId = Uuid;

/// Inbound events surfaced to the orchestrator.
#[derive(Debug)]
pub enum GatewayEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    Input {
        client: ClientId,
        text: String,
        source: Option<String>,
        images: Vec<String>,
    },
    Config {
        client: ClientId,
        config_item: String,
        value: Value,
    },
    Gamepad {
        client: ClientId,
        payload: GamepadPayload,
    },
    GamepadEmergencyStop {
        client: ClientId,
    },
}

type ClientRegistry = Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>;

/// Cloneable handle for outbound sends.
#[derive(Clone)]
pub struct GatewayHandle {
    clients: ClientRegistry,
    sender_name: String,
}

impl GatewayHandle {
    /// Send a frame to every connected client; clients whose channel is gone
    /// are removed from the registry.
    pub async fn broadcast(&self, frame: &str) {
        let mut clients = self.clients.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.send(Message::Text(frame.to_owned().into())).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!("removing unreachable client {id}");
            clients.remove(&id);
        }
    }

    /// Send a frame to one client. Returns false when the client is gone.
    pub async fn send_to(&self, client: ClientId, frame: &str) -> bool {
        let mut clients = self.clients.lock().await;
        let delivered = clients
            .get(&client)
            .map(|tx| tx.send(Message::Text(frame.to_owned().into())).is_ok())
            .unwrap_or(false);
        if !delivered {
            clients.remove(&client);
        }
        delivered
    }

    /// Convenience: `system` frame to one client.
    pub async fn send_system(
        &self,
        client: ClientId,
        level: SystemLevel,
        text: &str,
        detail: Option<&str>,
    ) {
        let frame = protocol::system(&self.sender_name, level, text, detail);
        self.send_to(client, &frame).await;
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Sender name stamped on outbound frames.
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }
}

#[derive(Clone)]
struct GatewayState {
    clients: ClientRegistry,
    events: mpsc::Sender<GatewayEvent>,
    sender_name: String,
}

/// Running gateway server.
pub struct TabletGateway {
    handle: GatewayHandle,
    server: tokio::task::JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl TabletGateway {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error when the port cannot be bound; this aborts startup.
    pub async fn serve(
        config: &GatewayConfig,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| UmebotError::Gateway(format!("cannot bind {address}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| UmebotError::Gateway(e.to_string()))?;

        let clients: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
        let state = GatewayState {
            clients: Arc::clone(&clients),
            events,
            sender_name: config.sender_name.clone(),
        };
        let app = Router::new()
            .route("/status", get(status))
            .route("/ws_bidirectional", get(ws_upgrade))
            .with_state(state);

        info!("tablet gateway listening on http://{local}");
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("tablet gateway server exited: {e}");
            }
        });

        Ok(Self {
            handle: GatewayHandle {
                clients,
                sender_name: config.sender_name.clone(),
            },
            server,
            local_addr: local,
        })
    }

    /// Outbound-send handle.
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop all connections.
    pub async fn shutdown(self) {
        self.server.abort();
        self.handle.clients.lock().await.clear();
        info!("tablet gateway stopped");
    }
}

async fn status(State(state): State<GatewayState>) -> impl IntoResponse {
    let clients = state.clients.lock().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "connected_clients": clients,
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: GatewayState) {
    let client = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: outbound frames for this client stay ordered.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    state.clients.lock().await.insert(client, tx);
    info!("tablet client connected: {client}");
    if state
        .events
        .send(GatewayEvent::ClientConnected(client))
        .await
        .is_err()
    {
        warn!("orchestrator event channel closed");
    }

    while let Some(incoming) = stream.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(e) => {
                debug!("client {client} receive error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => dispatch_frame(&state, client, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.clients.lock().await.remove(&client);
    info!("tablet client disconnected: {client}");
    let _ = state
        .events
        .send(GatewayEvent::ClientDisconnected(client))
        .await;
    writer.abort();
}

async fn dispatch_frame(state: &GatewayState, client: ClientId, raw: &str) {
    let parsed = match protocol::parse_client_frame(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("malformed frame from {client}: {e}");
            let frame = protocol::system(
                &state.sender_name,
                SystemLevel::Error,
                "Mensaje no valido.",
                Some(&e.to_string()),
            );
            let clients = state.clients.lock().await;
            if let Some(tx) = clients.get(&client) {
                let _ = tx.send(Message::Text(frame.into()));
            }
            return;
        }
    };

    let event = match parsed {
        ClientMessage::Input {
            text,
            source,
            images,
        } => GatewayEvent::Input {
            client,
            text,
            source,
            images,
        },
        ClientMessage::Config { config_item, value } => GatewayEvent::Config {
            client,
            config_item,
            value,
        },
        ClientMessage::Gamepad(payload) => {
            if payload.requests_estop() {
                GatewayEvent::GamepadEmergencyStop { client }
            } else {
                GatewayEvent::Gamepad { client, payload }
            }
        }
    };

    if state.events.send(event).await.is_err() {
        warn!("orchestrator event channel closed, dropping frame");
    }
}
