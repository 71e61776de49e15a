//! Plain data shapes shared by every state-backend implementation and the dispatcher.
//!
//! None of these types carry behaviour; they are the wire/storage shape of the
//! four indices described in the data model (session, invite, queue entry, room).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub connection_id: String,
    pub room_id: Option<String>,
    pub created_at: u64,
    pub last_seen_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InviteRecord {
    pub session_id: String,
    pub connection_id: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub session_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub room_id: String,
    pub session1: RoomMember,
    pub session2: RoomMember,
}

impl Room {
    pub fn other(&self, session_id: &str) -> Option<&RoomMember> {
        if self.session1.session_id == session_id {
            Some(&self.session2)
        } else if self.session2.session_id == session_id {
            Some(&self.session1)
        } else {
            None
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.session1.session_id == session_id || self.session2.session_id == session_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateCounter {
    pub count: u32,
    pub window_start: u64,
}

/// Milliseconds since the Unix epoch. Centralised so every caller agrees on
/// units, and anchored to `tokio::time::Instant` rather than
/// `SystemTime::now()` directly so that tests using `tokio::time::{pause,
/// advance}` (TTL and rate-limit window rollover) actually move this clock.
pub fn now_ms() -> u64 {
    use std::sync::OnceLock;
    use tokio::time::Instant;

    static EPOCH: OnceLock<(Instant, u64)> = OnceLock::new();
    let (instant0, wall0_ms) = *EPOCH.get_or_init(|| {
        let wall_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        (Instant::now(), wall_ms)
    });
    wall0_ms + Instant::now().saturating_duration_since(instant0).as_millis() as u64
}
