//! The `/ws` route and per-connection task (§4.K), mirroring the reference
//! relay server's `websocket_handler`/`websocket` split.
//!
//! A connection starts pre-login: it may ask for the instance list, log in,
//! or fire one of the one-shot peripheral-API verbs (which always close the
//! connection afterwards, success or failure). Once login succeeds the
//! connection is handed to its instance: from then on this task only ferries
//! raw JSON in and serialized `ServerMessage`s out, never touching instance
//! state itself.

use crate::controller::{ControllerId, OutboundSender};
use crate::error::ProtocolError;
use crate::server::{InstanceHandle, Server};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use protocol::{ClientMessage, ServerMessage, MAX_INBOUND_MESSAGE_BYTES};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub fn router(server: Arc<Server>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(server)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, server, remote_addr))
}

async fn run_connection(mut socket: WebSocket, server: Arc<Server>, remote_addr: SocketAddr) {
    let controller_id = server.alloc_controller_id();
    let (outbound_tx, mut outbound_rx): (OutboundSender, _) = mpsc::unbounded_channel();
    let mut logged_in: Option<InstanceHandle> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                let message = match incoming {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(?err, controller = controller_id, "websocket receive error");
                        break;
                    }
                };
                match message {
                    Message::Text(text) => {
                        let keep_going = handle_inbound_text(
                            &mut socket,
                            &server,
                            remote_addr,
                            controller_id,
                            &outbound_tx,
                            &mut logged_in,
                            text.as_str(),
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if send_json(&mut socket, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(handle) = logged_in {
        handle.disconnect(controller_id);
    }
    info!(controller = controller_id, %remote_addr, "connection closed");
}

/// Handles one inbound text frame, pre- or post-login. Returns whether the
/// connection should stay open.
async fn handle_inbound_text(
    socket: &mut WebSocket,
    server: &Arc<Server>,
    remote_addr: SocketAddr,
    controller_id: ControllerId,
    outbound_tx: &OutboundSender,
    logged_in: &mut Option<InstanceHandle>,
    text: &str,
) -> bool {
    if text.len() > MAX_INBOUND_MESSAGE_BYTES {
        let err = ProtocolError::MessageTooLarge { size: text.len(), max: MAX_INBOUND_MESSAGE_BYTES };
        let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
        return false;
    }

    let messages = match parse_batch(text) {
        Ok(messages) => messages,
        Err(err) => {
            let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
            return false;
        }
    };

    for message in messages {
        if let Some(handle) = logged_in.as_ref() {
            // Past login, raw messages go straight to the owning instance;
            // it validates and rejects on its own terms (§4.K).
            handle.inbound(controller_id, message);
            continue;
        }
        match dispatch_prelogin(socket, server, remote_addr, controller_id, outbound_tx, message).await {
            PreloginOutcome::Continue => {}
            PreloginOutcome::LoggedIn(handle) => *logged_in = Some(handle),
            PreloginOutcome::Close => return false,
        }
    }
    true
}

/// Splits `text` on its top-level JSON shape: a single object dispatches as
/// one message, an array dispatches element-by-element (§6.2). Parsing stops
/// at the first element that fails to parse, matching the "abort on first
/// error" rule — `Result::from_iter` over this map short-circuits.
fn parse_batch(text: &str) -> Result<Vec<ClientMessage>, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| ProtocolError::Malformed(e.to_string())))
        .collect()
}

enum PreloginOutcome {
    Continue,
    LoggedIn(InstanceHandle),
    Close,
}

async fn dispatch_prelogin(
    socket: &mut WebSocket,
    server: &Arc<Server>,
    remote_addr: SocketAddr,
    controller_id: ControllerId,
    outbound_tx: &OutboundSender,
    message: ClientMessage,
) -> PreloginOutcome {
    match message {
        ClientMessage::Prelogin => {
            let names = server.instance_names().await;
            let _ = send_json(socket, &ServerMessage::InstanceList { n: "relay-server".to_string(), l: names }).await;
            PreloginOutcome::Continue
        }
        ClientMessage::Login { u, p, n } => match server.login(controller_id, u, &p, &n, remote_addr, outbound_tx.clone()).await {
            Ok(handle) => PreloginOutcome::LoggedIn(handle),
            Err(err) => {
                let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
                PreloginOutcome::Close
            }
        },
        ClientMessage::SelfServeCreateUser { u, p, d } => {
            let result = server.users.self_serve_create(&u, &p, d).await;
            finish_one_shot(socket, result, "account created").await;
            PreloginOutcome::Close
        }
        ClientMessage::ChangeMyPassword { u, p, n } => {
            let result = server.users.change_password(&u, &p, &n).await;
            finish_one_shot(socket, result, "password changed").await;
            PreloginOutcome::Close
        }
        ClientMessage::GetMyConfig { u, p } => {
            match server.users.get_config(&u, &p).await {
                Ok(config) => {
                    let _ = send_json(socket, &ServerMessage::Done { d: config }).await;
                }
                Err(err) => {
                    let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
                }
            }
            PreloginOutcome::Close
        }
        ClientMessage::SetMyConfig { u, p, d } => {
            let result = server.users.set_config(&u, &p, d).await;
            finish_one_shot(socket, result, "config saved").await;
            PreloginOutcome::Close
        }
        ClientMessage::CleanShutdown { u, p, r } => {
            perform_shutdown(socket, server, &u, &p, &r, true).await;
            PreloginOutcome::Close
        }
        ClientMessage::DirtyShutdown { u, p, r } => {
            perform_shutdown(socket, server, &u, &p, &r, false).await;
            PreloginOutcome::Close
        }
        ClientMessage::Frame { .. } | ClientMessage::Command { .. } | ClientMessage::Chat { .. } => {
            let err = ProtocolError::Malformed("not logged in".to_string());
            let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
            PreloginOutcome::Close
        }
    }
}

async fn finish_one_shot(socket: &mut WebSocket, result: Result<(), ProtocolError>, done: &str) {
    match result {
        Ok(()) => {
            let _ = send_json(socket, &ServerMessage::Done { d: done.to_string() }).await;
        }
        Err(err) => {
            let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
        }
    }
}

/// `cleanShutdown`/`dirtyShutdown` (§4.J): admin-checked, builds the
/// whole-server snapshot, writes it per §4.I, then tears the process down.
async fn perform_shutdown(socket: &mut WebSocket, server: &Arc<Server>, username: &str, password: &str, reason: &str, clean: bool) {
    if let Err(err) = server.users.require_admin(username, password).await {
        let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
        return;
    }

    let snapshot = server.build_snapshot().await;
    let path = server.config.read().await.snapshot_path.clone();
    let result = if clean { crate::snapshot::clean_shutdown(&snapshot, &path) } else { crate::snapshot::dirty_shutdown(&snapshot, &path) };

    match result {
        Ok(()) => {
            info!(username, reason, clean, "admin shutdown: snapshot written, exiting");
            let _ = send_json(socket, &ServerMessage::Done { d: "shutting down".to_string() }).await;
        }
        Err(err) => {
            warn!(username, ?err, "admin shutdown: snapshot write failed");
            let _ = send_json(socket, &ServerMessage::Error { e: err.to_string() }).await;
            return;
        }
    }
    std::process::exit(0);
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("ServerMessage always serializes");
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_batch_is_one_message() {
        let batch = parse_batch(r#"{"k":"g","m":"hi"}"#).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], ClientMessage::Chat { .. }));
    }

    #[test]
    fn array_batch_dispatches_each_element_in_order() {
        let batch = parse_batch(r#"[{"k":"f","f":1,"i":"a"},{"k":"f","f":2,"i":"b"}]"#).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch[0], ClientMessage::Frame { f: 1, .. }));
        assert!(matches!(batch[1], ClientMessage::Frame { f: 2, .. }));
    }

    #[test]
    fn array_batch_aborts_at_the_first_malformed_element() {
        let err = parse_batch(r#"[{"k":"f","f":1,"i":"a"},{"k":"nonsense"}]"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
