//! End-to-end scenarios driven through the dispatcher directly (no real
//! sockets), covering the named scenarios in the testable-properties
//! section: invite happy path, rate limiting, and the mutual-exclusion
//! invariant across queue/invite/room.

use anon_relay::dispatch::{dispatch, InboundEnvelope};
use anon_relay::state::AppState;
use serde_json::json;

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
async fn invite_happy_path_then_second_redemption_fails() {
    let state = AppState::new_local_for_tests();
    let mut a = join(&state, "conn-a", "alice").await;
    let mut b = join(&state, "conn-b", "bob").await;

    let code = state.invites.create("alice", "conn-a").await.unwrap();
    assert!(code.starts_with("TALK-"));

    dispatch(
        &state,
        "conn-b",
        &mut b,
        InboundEnvelope {
            event: "join-invite".to_string(),
            data: json!({ "code": code }),
        },
    )
    .await;

    let alice = state.sessions.get_session("alice").await.unwrap().unwrap();
    let bob = state.sessions.get_session("bob").await.unwrap().unwrap();
    assert!(alice.room_id.is_some());
    assert_eq!(alice.room_id, bob.room_id);

    // second redemption of the same code must fail, not leak why
    let mut c = join(&state, "conn-c", "carol").await;
    dispatch(
        &state,
        "conn-c",
        &mut c,
        InboundEnvelope {
            event: "join-invite".to_string(),
            data: json!({ "code": code }),
        },
    )
    .await;
    assert!(state
        .sessions
        .get_session("carol")
        .await
        .unwrap()
        .unwrap()
        .room_id
        .is_none());
}

#[tokio::test]
async fn mutual_exclusion_invariant_holds_across_transitions() {
    let state = AppState::new_local_for_tests();
    let mut a = join(&state, "conn-a", "alice").await;

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

    // create-invite while queued must be rejected, and must not disturb the
    // queue membership
    dispatch(
        &state,
        "conn-a",
        &mut a,
        InboundEnvelope {
            event: "create-invite".to_string(),
            data: json!({}),
        },
    )
    .await;
    assert!(state.matchmaker.is_in_queue("alice").await.unwrap());
    assert!(!state.invites.has_invite("alice").await.unwrap());
}

#[tokio::test]
async fn rate_limit_window_resets_after_advance() {
    tokio::time::pause();
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

    tokio::time::advance(std::time::Duration::from_millis(61_000)).await;
    assert!(state.rate_limiter.is_allowed("alice").await.unwrap());
}
