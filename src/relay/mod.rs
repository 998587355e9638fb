//! The relay server.
//!
//! A single websocket upgrade endpoint, `/connect?id=<token>&capabilities=
//! <tags>`, admits clients into per-token sessions. Each accepted socket
//! runs one receive loop and one send task; everything a session's members
//! share is serialized inside [`session::Connection`]. A periodic sweep
//! ([`liveness`]) closes sockets that stop producing traffic.

pub mod liveness;
pub mod router;
pub mod session;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{Capability, CapabilitySet, MAX_PACKET_SIZE, close_code, codec};
use crate::token::Token;
use session::{AdmitError, SessionRegistry};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Termlink relay - routes terminal and file sync sessions"
)]
pub struct Args {
    /// Host to bind the relay to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the relay
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the relay's route table. Exposed so tests can serve it on an
/// ephemeral listener.
pub fn relay_app(state: AppState) -> Router {
    Router::new()
        .route("/connect", get(handle_connect))
        .with_state(state)
}

/// Run the relay until the listener fails.
pub async fn run_relay_server(args: Args) -> Result<()> {
    let state = AppState::new();
    liveness::spawn_sweeper(state.registry.clone(), liveness::SWEEP_PERIOD);

    let app = relay_app(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Relay listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Relay server error: {:?}", e);
    }

    Ok(())
}

#[derive(Deserialize)]
struct ConnectQuery {
    id: Option<String>,
    capabilities: Option<String>,
}

/// Admission pre-checks run before the upgrade handshake completes, so a
/// bad request is turned away with a plain HTTP status. The exclusive-host
/// check can lose a race between here and the socket opening; `admit`
/// re-checks it under the session lock.
async fn handle_connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token: Token = match query.id.as_deref().map(str::parse) {
        Some(Ok(token)) => token,
        Some(Err(err)) => {
            debug!(%err, "rejecting connect: bad token");
            return (StatusCode::BAD_REQUEST, "expected session token").into_response();
        }
        None => return (StatusCode::BAD_REQUEST, "expected session token").into_response(),
    };

    let capabilities = match query.capabilities.as_deref().map(CapabilitySet::parse_list) {
        Some(Ok(capabilities)) => capabilities,
        Some(Err(err)) => {
            debug!(token = %token, %err, "rejecting connect: bad capabilities");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
        None => return (StatusCode::BAD_REQUEST, "expected capabilities").into_response(),
    };

    if capabilities.contains(Capability::TerminalHost)
        && state.registry.host_already_held(&token).await
    {
        debug!(token = %token, "rejecting connect: terminal:host already held");
        return (StatusCode::FORBIDDEN, "terminal:host is already held").into_response();
    }

    let registry = state.registry.clone();
    ws.max_message_size(MAX_PACKET_SIZE)
        .on_upgrade(move |socket| handle_session_socket(socket, registry, token, capabilities))
}

fn admit_close_code(err: &AdmitError) -> u16 {
    match err {
        AdmitError::HostHeld => close_code::POLICY_VIOLATION,
        AdmitError::IdsExhausted => close_code::TRY_AGAIN_LATER,
        AdmitError::Released => close_code::NORMAL,
    }
}

async fn handle_session_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    token: Token,
    capabilities: CapabilitySet,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    // Admission proper, under the session lock. A released session means we
    // raced its teardown: resolve again and join the replacement.
    let (connection, client_id) = loop {
        let connection = registry.resolve(&token);
        match connection.admit(capabilities, outbox_tx.clone()).await {
            Ok(id) => break (connection, id),
            Err(AdmitError::Released) => continue,
            Err(err) => {
                warn!(token = %token, %err, "rejecting socket after upgrade");
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code: admit_close_code(&err),
                        reason: Utf8Bytes::from(err.to_string()),
                    })))
                    .await;
                return;
            }
        }
    };
    // The session's client entry now owns the only long-lived sender; the
    // send task below ends once that entry is removed.
    drop(outbox_tx);

    info!(token = %token, client = client_id, %capabilities, "client connected");

    // Drains the outbox onto the socket. A queued close frame is forwarded
    // and ends the task; that is how the liveness sweep tears a socket down.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Decodes and routes inbound frames. Any frame at all proves liveness;
    // malformed packets are dropped without ceremony.
    let recv_connection = connection.clone();
    let recv_token = token.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match codec::decode(text.as_str()) {
                    Ok(packet) => recv_connection.handle_packet(client_id, packet).await,
                    Err(err) => {
                        debug!(
                            token = %recv_token,
                            client = client_id,
                            %err,
                            "dropping malformed packet"
                        );
                        recv_connection.mark_alive(client_id).await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => recv_connection.mark_alive(client_id).await,
                Err(err) => {
                    debug!(token = %recv_token, client = client_id, %err, "socket error");
                    break;
                }
            }
        }
    });

    // Whichever side finishes first, the other is aborted so the socket
    // halves drop and the peer sees a hard close.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Whichever side ended first, tear the whole socket down and leave the
    // session. The membership broadcast to the remaining clients happens
    // inside remove().
    let emptied = connection.remove(client_id).await;
    if emptied {
        registry.release(&token);
    }
    info!(token = %token, client = client_id, "client disconnected");
}
