//! `/health` and admin HTTP surface (§4.J).
//!
//! Deliberately not built on a web framework — the spec calls for no
//! dependency beyond what's already pulled in for the socket transport, so
//! this is a hand-rolled accept loop in the same shape as the WebSocket
//! listener in [`crate::transport`], just parsing a single HTTP request line
//! instead of performing a WebSocket upgrade.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::state::AppState;

pub async fn run(state: Arc<AppState>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let started_at = Instant::now();
    tracing::info!(%addr, "health listener bound");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "health listener accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, &state, started_at).await {
                debug!(%peer, error = %e, "health connection error");
            }
        });
    }
}

async fn serve_one(stream: TcpStream, state: &AppState, started_at: Instant) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    // Drain the remaining header lines without interpreting most of them;
    // only `x-admin-key` is of interest, and only for non-health routes.
    let mut admin_key_header = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("x-admin-key") {
                admin_key_header = Some(value.trim().to_string());
            }
        }
    }

    let stream = reader.into_inner();
    let (status, body) = route(state, method, path, admin_key_header.as_deref(), started_at).await;
    write_response(stream, status, &body).await
}

async fn route(
    state: &AppState,
    method: &str,
    path: &str,
    admin_key_header: Option<&str>,
    started_at: Instant,
) -> (u16, serde_json::Value) {
    if method != "GET" {
        return (405, json!({ "error": "method not allowed" }));
    }

    let (raw_path, query) = path.split_once('?').unwrap_or((path, ""));

    if raw_path == "/health" {
        return (200, health_body(state, started_at).await);
    }

    let admin_key_query = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("admin_key="));
    let supplied = admin_key_header.or(admin_key_query);
    if !state.config.admin_key_matches(supplied) {
        return (401, json!({ "error": "unauthorized" }));
    }

    (404, json!({ "error": "not found" }))
}

async fn health_body(state: &AppState, started_at: Instant) -> serde_json::Value {
    let sessions = state.sessions.session_count().await.unwrap_or(0);
    let waiting = state.matchmaker.queue_len().await.unwrap_or(0);
    let rooms = state.matchmaker.room_count().await.unwrap_or(0);
    json!({
        "status": "ok",
        "uptime": started_at.elapsed().as_secs(),
        "activeSessions": sessions,
        "waitingInQueue": waiting,
        "activeRooms": rooms,
    })
}

async fn write_response(mut stream: TcpStream, status: u16, body: &serde_json::Value) -> anyhow::Result<()> {
    let text = body.to_string();
    let status_line = match status {
        200 => "200 OK",
        401 => "401 Unauthorized",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        _ => "500 Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
        text.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
