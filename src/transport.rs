//! WebSocket accept loop (§4.H), grounded in the signal server's per-connection
//! reader/writer task split: a writer task drained by an unbounded channel so
//! fan-out from other connections' tasks never blocks on this socket, and a
//! reader loop that feeds parsed envelopes straight into the dispatcher.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{dispatch, handle_disconnect, InboundEnvelope};
use crate::hub::{ConnectionSender, Hub, WsOutbound};
use crate::state::AppState;

/// Matches the 30 MiB wire cap in §4.H — distinct from the 35 MiB
/// decoded-payload cap enforced inside the dispatcher, since the two measure
/// different things (raw frame bytes vs. decoded base64 content).
const MAX_FRAME_BYTES: usize = 30 * 1024 * 1024;

pub async fn run(state: Arc<AppState>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "websocket listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(state: Arc<AppState>, stream: TcpStream) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx): (ConnectionSender, _) = mpsc::unbounded_channel();

    let connection_id = Uuid::new_v4().to_string();
    state.hub.register(connection_id.clone(), tx);

    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                WsOutbound::Send(msg) => sink.send(msg).await,
                WsOutbound::Close => sink.close().await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let mut current_session: Option<String> = None;

    loop {
        let msg = match source.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(%connection_id, error = %e, "websocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    state
                        .hub
                        .send(&connection_id, "error", serde_json::json!({ "message": "Message too large" }))
                        .await;
                    continue;
                }
                match serde_json::from_str::<InboundEnvelope>(&text) {
                    Ok(envelope) => {
                        dispatch(&state, &connection_id, &mut current_session, envelope).await;
                    }
                    Err(e) => {
                        debug!(%connection_id, error = %e, "malformed envelope");
                        state
                            .hub
                            .send(&connection_id, "error", serde_json::json!({ "message": "Malformed message" }))
                            .await;
                    }
                }
            }
            Message::Binary(data) if data.len() > MAX_FRAME_BYTES => {
                state
                    .hub
                    .send(&connection_id, "error", serde_json::json!({ "message": "Message too large" }))
                    .await;
            }
            Message::Close(_) => break,
            _ => {} // ping/pong/binary handled by tungstenite or ignored
        }
    }

    state.hub.unregister(&connection_id);
    writer_task.abort();

    if let Some(session_id) = current_session {
        if let Err(e) = handle_disconnect(&state, &connection_id, &session_id).await {
            warn!(%connection_id, error = %e, "disconnect cleanup failed");
        }
    }

    Ok(())
}
