//! Expiry sweeper (§4.G): periodically evicts sessions idle past the TTL.
//!
//! Deliberately thin — it finds expired sessions and funnels each one
//! through the exact same cleanup path a normal disconnect takes
//! ([`crate::dispatch::handle_disconnect`]), per the "expiry as first-class
//! event" design note. There is no separate cascade implementation here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::dispatch::handle_disconnect;
use crate::hub::Hub;
use crate::state::AppState;

pub async fn run(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&state).await {
            warn!(error = %e, "expiry sweep failed");
        }
    }
}

async fn sweep_once(state: &AppState) -> anyhow::Result<()> {
    let ttl_ms = state.config.session_ttl.as_millis() as u64;
    let expired = state.sessions.expired_sessions(ttl_ms).await?;
    if expired.is_empty() {
        return Ok(());
    }
    info!(count = expired.len(), "sweeping expired sessions");

    for session in expired {
        state.hub.close(&session.connection_id).await;
        if let Err(e) = handle_disconnect(state, &session.connection_id, &session.session_id).await {
            warn!(
                session_id = %session.session_id,
                error = %e,
                "cleanup failed for expired session"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_evicts_sessions_past_ttl() {
        tokio::time::pause();
        let state = AppState::new_local_for_tests();
        state.sessions.add_session("alice", "conn-a").await.unwrap();

        tokio::time::advance(Duration::from_secs(2000)).await;

        sweep_once(&state).await.unwrap();
        assert!(state.sessions.get_session("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_nothing_expired() {
        tokio::time::pause();
        let state = AppState::new_local_for_tests();
        state.sessions.add_session("alice", "conn-a").await.unwrap();

        sweep_once(&state).await.unwrap();
        assert!(state.sessions.get_session("alice").await.unwrap().is_some());
    }
}
