//! Event dispatcher (§4.F): maps inbound `{event, data}` envelopes to
//! state-backend operations and fan-out to the peer's current connection.
//!
//! Payloads are never modeled as a single tagged enum because several events
//! (`security-alert`, `key-exchange`, `send-encrypted`) carry opaque,
//! forward-compatible data the server relays without ever inspecting beyond
//! the one field it needs — a tagged enum would force us to name and parse
//! fields we're contractually required to leave alone.

use serde::Deserialize;
use serde_json::json;

use crate::error::{DResult, DispatchError};
use crate::hub::Hub;
use crate::matchmaking::JoinQueueOutcome;
use crate::model::Room;
use crate::state::AppState;

/// Raw shape of every inbound message: an event name plus an opaque payload.
/// Fields the handler doesn't care about are simply never deserialized out
/// of `data`.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// 35 MiB, measured on the *decoded* payload per §4.F.
const MAX_DECODED_PAYLOAD_BYTES: usize = 35 * 1024 * 1024;

/// Estimates the decoded length of a base64 string without actually
/// decoding it: `floor(len * 3 / 4) - padCount`.
fn base64_decoded_len_estimate(s: &str) -> usize {
    let pad = if s.ends_with("==") {
        2
    } else if s.ends_with('=') {
        1
    } else {
        0
    };
    (s.len() * 3 / 4).saturating_sub(pad)
}

fn non_empty_string(value: &serde_json::Value, field: &str) -> Result<String, DispatchError> {
    match value.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(DispatchError::InvalidInput(format!(
            "{field} must be a non-empty string"
        ))),
    }
}

/// Entry point driven by the transport layer once per inbound message.
/// `current_session` is the connection's bound session, if any — `join` is
/// the only handler allowed to set it.
pub async fn dispatch(
    state: &AppState,
    connection_id: &str,
    current_session: &mut Option<String>,
    envelope: InboundEnvelope,
) {
    // Any event on a bound session counts as activity, resetting the TTL
    // clock regardless of whether the event itself succeeds.
    if let Some(sid) = current_session.as_deref() {
        let _ = state.sessions.touch(sid).await;
    }

    let result = match envelope.event.as_str() {
        "join" => handle_join(state, connection_id, current_session, &envelope.data).await,
        "find-random" => with_session(current_session, |sid| {
            handle_find_random(state, connection_id, sid)
        })
        .await,
        "cancel-search" => with_session(current_session, |sid| handle_cancel_search(state, sid)).await,
        "create-invite" => {
            with_session(current_session, |sid| {
                handle_create_invite(state, connection_id, sid)
            })
            .await
        }
        "join-invite" => {
            with_session(current_session, |sid| {
                handle_join_invite(state, connection_id, sid, &envelope.data)
            })
            .await
        }
        "key-exchange" => {
            with_session(current_session, |sid| {
                handle_key_exchange(state, sid, &envelope.data)
            })
            .await
        }
        "send-encrypted" => {
            with_session(current_session, |sid| {
                handle_send_encrypted(state, sid, &envelope.data)
            })
            .await
        }
        "security-alert" => {
            with_session(current_session, |sid| {
                handle_security_alert(state, sid, envelope.data.clone())
            })
            .await
        }
        "chat-ready" => with_session(current_session, |sid| handle_chat_ready(state, sid)).await,
        "report" => with_session(current_session, |sid| handle_report(state, connection_id, sid)).await,
        "leave-room" => with_session(current_session, |sid| handle_leave_room(state, sid)).await,
        other => Err(DispatchError::InvalidInput(format!("unknown event {other:?}"))),
    };

    if let Err(e) = result {
        state
            .hub
            .send(connection_id, "error", json!({ "message": e.to_string() }))
            .await;
    }
}

/// Most handlers require an already-bound session; this factors out the
/// "no `join` yet" precondition so each handler body only deals with its own
/// logic.
async fn with_session<'a, F, Fut>(current_session: &'a Option<String>, f: F) -> DResult<()>
where
    F: FnOnce(&'a str) -> Fut,
    Fut: std::future::Future<Output = DResult<()>>,
{
    match current_session {
        Some(sid) => f(sid).await,
        None => Err(DispatchError::PreconditionViolated("not joined".to_string())),
    }
}

/// Called by the transport layer when a connection's socket closes, and by
/// the expiry sweeper for a timed-out session — the same cascade either way
/// (§9 "expiry as first-class event").
pub async fn handle_disconnect(state: &AppState, connection_id: &str, session_id: &str) -> DResult<()> {
    // A prior connection's disconnect arriving after a newer `join` has
    // already taken over this session id must not clean up the new
    // connection's state (§5 force-disconnect safety).
    match state.sessions.get_session(session_id).await? {
        Some(s) if s.connection_id == connection_id => {}
        _ => return Ok(()),
    }
    cascade_cleanup_holdings(state, session_id, "The other person has left.").await?;
    state.sessions.remove_session(session_id).await?;
    Ok(())
}

/// Everything a session might be holding — queue slot, invite, room — is
/// released, but the session record itself is left alone. Shared by
/// `disconnect` (which removes the session afterward) and `join`'s takeover
/// path (which must not, since the session now belongs to the new
/// connection).
async fn cascade_cleanup_holdings(state: &AppState, session_id: &str, leave_reason: &str) -> DResult<()> {
    state.matchmaker.leave_queue(session_id).await?;
    state.invites.cancel(session_id).await?;
    notify_and_destroy_room(state, session_id, leave_reason).await?;
    state.rate_limiter.clear(session_id).await?;
    Ok(())
}

async fn notify_and_destroy_room(state: &AppState, session_id: &str, reason: &str) -> DResult<()> {
    if let Some(room) = state.matchmaker.get_room_by_session(session_id).await? {
        if let Some(peer_conn) = state
            .matchmaker
            .get_peer_connection_id(&room.room_id, session_id)
            .await?
        {
            state
                .hub
                .send(&peer_conn, "chat-ended", json!({ "reason": reason }))
                .await;
        }
        state.matchmaker.destroy_room(&room.room_id).await?;
    }
    Ok(())
}

async fn handle_join(
    state: &AppState,
    connection_id: &str,
    current_session: &mut Option<String>,
    data: &serde_json::Value,
) -> DResult<()> {
    let session_id = non_empty_string(data, "sessionId")?;

    let prior = state.sessions.add_session(&session_id, connection_id).await?;
    *current_session = Some(session_id.clone());

    if let Some(prior) = prior {
        if prior.connection_id != connection_id {
            // The registry already points at `connection_id` at this point,
            // so the old connection's own disconnect (triggered by the
            // close below) will see the mismatch and no-op.
            state.hub.close(&prior.connection_id).await;
            cascade_cleanup_holdings(state, &session_id, "The other person has left.").await?;
        }
    }

    state.hub.send(connection_id, "joined", json!({})).await;
    Ok(())
}

async fn handle_find_random(state: &AppState, connection_id: &str, session_id: &str) -> DResult<()> {
    let session = require_session(state, session_id).await?;
    if session.room_id.is_some() {
        return Err(DispatchError::PreconditionViolated(
            "Already in a chat".to_string(),
        ));
    }

    if state.invites.has_invite(session_id).await? {
        state.invites.cancel(session_id).await?;
    }

    match state.matchmaker.join_queue(session_id, connection_id).await? {
        JoinQueueOutcome::Matched(room) => emit_matched(state, connection_id, session_id, &room).await,
        JoinQueueOutcome::Waiting | JoinQueueOutcome::AlreadyQueued => {
            state.hub.send(connection_id, "waiting", json!({})).await;
            Ok(())
        }
    }
}

async fn emit_matched(state: &AppState, connection_id: &str, session_id: &str, room: &Room) -> DResult<()> {
    let payload = json!({ "roomId": room.room_id });
    state.hub.send(connection_id, "matched", payload.clone()).await;
    let peer = room
        .other(session_id)
        .unwrap_or_else(|| panic!("room does not contain session {session_id}"));
    state.hub.send(&peer.connection_id, "matched", payload).await;
    Ok(())
}

async fn handle_cancel_search(state: &AppState, session_id: &str) -> DResult<()> {
    state.matchmaker.leave_queue(session_id).await?;
    notify_and_destroy_room(state, session_id, "The other person has left.").await
}

async fn handle_create_invite(state: &AppState, connection_id: &str, session_id: &str) -> DResult<()> {
    let session = require_session(state, session_id).await?;
    if session.room_id.is_some() {
        return Err(DispatchError::PreconditionViolated(
            "Already in a chat".to_string(),
        ));
    }
    if state.matchmaker.is_in_queue(session_id).await? {
        return Err(DispatchError::PreconditionViolated(
            "Already searching for a random match".to_string(),
        ));
    }

    if state.invites.has_invite(session_id).await? {
        state.invites.cancel(session_id).await?;
    }

    let code = state.invites.create(session_id, connection_id).await?;
    state
        .hub
        .send(connection_id, "invite-created", json!({ "code": code }))
        .await;
    Ok(())
}

async fn handle_join_invite(
    state: &AppState,
    connection_id: &str,
    session_id: &str,
    data: &serde_json::Value,
) -> DResult<()> {
    let session = require_session(state, session_id).await?;
    if session.room_id.is_some() {
        return Err(DispatchError::PreconditionViolated(
            "Already in a chat".to_string(),
        ));
    }
    if state.matchmaker.is_in_queue(session_id).await? {
        return Err(DispatchError::PreconditionViolated(
            "Already searching for a random match".to_string(),
        ));
    }
    let raw_code = non_empty_string(data, "code")?;

    let record = state.invites.redeem(&raw_code).await?;

    if record.session_id == session_id {
        return Err(DispatchError::PreconditionViolated(
            "Cannot join your own invite".to_string(),
        ));
    }
    let issuer = state
        .sessions
        .get_session(&record.session_id)
        .await?
        .ok_or_else(|| DispatchError::NotFound("Invite code not found or expired".to_string()))?;
    if issuer.room_id.is_some() {
        return Err(DispatchError::NotFound(
            "Invite code not found or expired".to_string(),
        ));
    }

    state.matchmaker.leave_queue(session_id).await?;
    state.matchmaker.leave_queue(&record.session_id).await?;

    let room = Room {
        room_id: uuid::Uuid::new_v4().to_string(),
        session1: crate::model::RoomMember {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
        },
        session2: crate::model::RoomMember {
            session_id: record.session_id.clone(),
            connection_id: issuer.connection_id.clone(),
        },
    };
    state.matchmaker.install_room(room.clone()).await?;

    let payload = json!({ "roomId": room.room_id });
    state.hub.send(connection_id, "matched", payload.clone()).await;
    state.hub.send(&issuer.connection_id, "matched", payload).await;
    Ok(())
}

async fn require_in_room(state: &AppState, session_id: &str) -> DResult<Room> {
    state
        .matchmaker
        .get_room_by_session(session_id)
        .await?
        .ok_or_else(|| DispatchError::PreconditionViolated("Not in a chat".to_string()))
}

async fn require_session(state: &AppState, session_id: &str) -> DResult<crate::model::Session> {
    state
        .sessions
        .get_session(session_id)
        .await?
        .ok_or_else(|| DispatchError::PreconditionViolated("not joined".to_string()))
}

async fn handle_key_exchange(state: &AppState, session_id: &str, data: &serde_json::Value) -> DResult<()> {
    let room = require_in_room(state, session_id).await?;
    let public_key = non_empty_string(data, "publicKey")?;
    if let Some(peer_conn) = state
        .matchmaker
        .get_peer_connection_id(&room.room_id, session_id)
        .await?
    {
        state
            .hub
            .send(&peer_conn, "peer-key", json!({ "publicKey": public_key }))
            .await;
    }
    Ok(())
}

async fn handle_send_encrypted(state: &AppState, session_id: &str, data: &serde_json::Value) -> DResult<()> {
    let room = require_in_room(state, session_id).await?;
    let encrypted = non_empty_string(data, "encrypted")?;

    // The token is consumed even if the peer lookup below finds no
    // recipient (§9 open question: avoids a drain-attack exploit).
    if !state.rate_limiter.is_allowed(session_id).await? {
        return Err(DispatchError::RateLimited);
    }
    if base64_decoded_len_estimate(&encrypted) > MAX_DECODED_PAYLOAD_BYTES {
        return Err(DispatchError::Oversize);
    }

    if let Some(peer_conn) = state
        .matchmaker
        .get_peer_connection_id(&room.room_id, session_id)
        .await?
    {
        state
            .hub
            .send(&peer_conn, "receive-encrypted", json!({ "encrypted": encrypted }))
            .await;
    }
    Ok(())
}

async fn handle_security_alert(
    state: &AppState,
    session_id: &str,
    data: serde_json::Value,
) -> DResult<()> {
    let room = require_in_room(state, session_id).await?;
    if let Some(peer_conn) = state
        .matchmaker
        .get_peer_connection_id(&room.room_id, session_id)
        .await?
    {
        state.hub.send(&peer_conn, "peer-security-alert", data).await;
    }
    Ok(())
}

async fn handle_chat_ready(state: &AppState, session_id: &str) -> DResult<()> {
    let room = require_in_room(state, session_id).await?;
    if let Some(peer_conn) = state
        .matchmaker
        .get_peer_connection_id(&room.room_id, session_id)
        .await?
    {
        state.hub.send(&peer_conn, "peer-ready", json!({})).await;
    }
    Ok(())
}

async fn handle_report(state: &AppState, connection_id: &str, session_id: &str) -> DResult<()> {
    let room = require_in_room(state, session_id).await?;
    let reason = "Chat ended due to a report.";
    let payload = json!({ "reason": reason });

    state.hub.send(connection_id, "chat-ended", payload.clone()).await;
    state.hub.close(connection_id).await;

    if let Some(peer_conn) = state
        .matchmaker
        .get_peer_connection_id(&room.room_id, session_id)
        .await?
    {
        state.hub.send(&peer_conn, "chat-ended", payload).await;
        state.hub.close(&peer_conn).await;
    }

    state.matchmaker.destroy_room(&room.room_id).await?;
    Ok(())
}

async fn handle_leave_room(state: &AppState, session_id: &str) -> DResult<()> {
    notify_and_destroy_room(state, session_id, "The other person has left.").await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn join(state: &AppState, conn: &str, session: &str) -> Option<String> {
        let mut current = None;
        dispatch(
            state,
            conn,
            &mut current,
            InboundEnvelope {
                event: "join".to_string(),
                data: json!({ "sessionId": session }),
            },
        )
        .await;
        current
    }

    #[tokio::test]
    async fn random_pairing_matches_both_sides() {
        let state = AppState::new_local_for_tests();
        let mut a = join(&state, "conn-a", "alice").await;
        let mut b = join(&state, "conn-b", "bob").await;

        dispatch(
            &state,
            "conn-a",
            &mut a,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;
        assert!(state.matchmaker.is_in_queue("alice").await.unwrap());

        dispatch(
            &state,
            "conn-b",
            &mut b,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;
        assert!(!state.matchmaker.is_in_queue("alice").await.unwrap());
        assert!(state
            .matchmaker
            .get_room_by_session("alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn self_invite_is_rejected_and_no_room_forms() {
        let state = AppState::new_local_for_tests();
        let mut a = join(&state, "conn-a", "alice").await;
        let code = state.invites.create("alice", "conn-a").await.unwrap();

        dispatch(
            &state,
            "conn-a",
            &mut a,
            InboundEnvelope {
                event: "join-invite".to_string(),
                data: json!({ "code": code }),
            },
        )
        .await;

        assert!(state
            .matchmaker
            .get_room_by_session("alice")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_join_force_closes_old_connection() {
        let state = AppState::new_local_for_tests();
        let mut a1 = join(&state, "conn-1", "alice").await;
        let mut a2 = join(&state, "conn-2", "alice").await;
        assert_eq!(a1.as_deref(), Some("alice"));
        assert_eq!(a2.as_deref(), Some("alice"));

        let session = state.sessions.get_session("alice").await.unwrap().unwrap();
        assert_eq!(session.connection_id, "conn-2");

        // the stale connection's own disconnect must now be a no-op
        handle_disconnect(&state, "conn-1", "alice").await.unwrap();
        assert!(state.sessions.get_session("alice").await.unwrap().is_some());

        handle_disconnect(&state, "conn-2", "alice").await.unwrap();
        assert!(state.sessions.get_session("alice").await.unwrap().is_none());
        let _ = (&mut a1, &mut a2);
    }

    #[tokio::test]
    async fn disconnect_mid_chat_notifies_peer_and_clears_room() {
        let state = AppState::new_local_for_tests();
        let mut a = join(&state, "conn-a", "alice").await;
        let mut b = join(&state, "conn-b", "bob").await;
        dispatch(
            &state,
            "conn-a",
            &mut a,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;
        dispatch(
            &state,
            "conn-b",
            &mut b,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;

        handle_disconnect(&state, "conn-a", "alice").await.unwrap();
        assert!(state
            .matchmaker
            .get_room_by_session("bob")
            .await
            .unwrap()
            .is_none());
        assert!(state.sessions.get_session("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_blocks_the_31st_message_in_a_window() {
        let state = AppState::new_local_for_tests();
        let mut a = join(&state, "conn-a", "alice").await;
        let mut b = join(&state, "conn-b", "bob").await;
        dispatch(
            &state,
            "conn-a",
            &mut a,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;
        dispatch(
            &state,
            "conn-b",
            &mut b,
            InboundEnvelope {
                event: "find-random".to_string(),
                data: json!({}),
            },
        )
        .await;

        for _ in 0..30 {
            assert!(state.rate_limiter.is_allowed("alice").await.unwrap());
        }
        assert!(!state.rate_limiter.is_allowed("alice").await.unwrap());
    }
}
