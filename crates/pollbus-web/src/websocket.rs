//! WebSocket transport for stream sessions.
//!
//! Each connection runs three tasks: a writer that owns the socket sink, a
//! reader that feeds control frames into the session, and a push loop that
//! forwards notifications and drives resync and keepalive.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use pollbus_core::{CloseReason, ServerMessage, SessionConfig, StreamSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::{identity_from, AppState};

/// Frames queued for the writer before the push loop backs off.
const OUTBOUND_BUFFER: usize = 64;

/// How long the writer may take to flush after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = identity_from(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Serialize a frame and hand it to the writer. `false` once the writer is gone.
async fn queue(tx: &mpsc::Sender<Message>, frame: &ServerMessage) -> bool {
    match frame.to_text() {
        Ok(text) => tx.send(Message::Text(text.into())).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "Failed to encode frame");
            true
        }
    }
}

/// Handle individual WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<String>) {
    let session = match state.bus.open_session(identity) {
        Ok(session) => Arc::new(session),
        Err(err) => {
            debug!(error = %err, "Rejected WebSocket client");
            return;
        }
    };
    let session_id = session.id();
    info!(%session_id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer_session = Arc::clone(&session);
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(msg).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                writer_session.begin_close(CloseReason::Closed);
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut push_task = tokio::spawn(push_loop(
        Arc::clone(&session),
        state.bus.config().session.clone(),
        out_tx.clone(),
    ));

    let recv_session = Arc::clone(&session);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            recv_session.touch();
            match msg {
                Message::Text(text) => {
                    debug!("Received from WebSocket client: {}", text.as_str());
                    if let Some(reply) = recv_session.handle_text(text.as_str()) {
                        if !queue(&out_tx, &reply).await {
                            break;
                        }
                    }
                }
                Message::Binary(_) => {
                    let reply = ServerMessage::error("Binary frames are not supported");
                    if !queue(&out_tx, &reply).await {
                        break;
                    }
                }
                Message::Close(_) => {
                    debug!("WebSocket client sent close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for any task to complete
    tokio::select! {
        _ = &mut send_task => {},
        _ = &mut push_task => {},
        _ = &mut recv_task => {},
    }

    session.close();
    recv_task.abort();
    push_task.abort();
    // With every sender gone the writer drains what is queued and closes.
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!(%session_id, reason = ?session.close_reason(), "WebSocket client disconnected");
}

/// Forward notifications to the writer, resync from the store and keep the
/// connection alive. Runs until the session stops delivering.
async fn push_loop(
    session: Arc<StreamSession>,
    config: SessionConfig,
    out: mpsc::Sender<Message>,
) {
    let mut resync = interval(config.resync_interval());
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = interval(config.keepalive_interval());
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            batch = session.next_batch() => {
                let Some(notifications) = batch else { break };
                let frame = ServerMessage::Notification { notifications };
                if !queue(&out, &frame).await {
                    break;
                }
            }
            _ = resync.tick() => {
                session.resync();
            }
            _ = keepalive.tick() => {
                let idle = session.idle_for();
                if idle > config.idle_timeout() {
                    info!(session_id = %session.id(), ?idle, "Closing idle WebSocket session");
                    session.begin_close(CloseReason::Closed);
                    break;
                }
                if out.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    if session.close_reason() == Some(CloseReason::BacklogExceeded) {
        let frame = ServerMessage::error("Backlog exceeded, reconnect with options.last");
        let _ = queue(&out, &frame).await;
    }
}
