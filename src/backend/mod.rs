//! The polymorphic state backend (§4.A).
//!
//! Every higher layer — session registry, rate limiter, invite store,
//! matchmaking & rooms — programs against [`StateBackend`] rather than
//! against either concrete implementation. This is the same shape this
//! codebase already uses for interchangeable session stores (see the
//! signal server's `SessionStorage` trait): one capability interface, swapped
//! wholesale at startup based on process configuration.

pub mod local;
pub mod redis_backend;

use async_trait::async_trait;

use crate::error::BResult;
use crate::model::{InviteRecord, Room, Session};

/// A single popped queue waiter: who it was and which connection it recorded
/// at insertion time (which may now be stale — see §9 design notes).
pub type QueueWaiter = (String, String);

#[async_trait]
pub trait StateBackend: Send + Sync {
    // ---- session registry (§4.B) ----

    /// Upsert `(session_id, connection_id)`, resetting `last_seen_at`.
    /// Returns the session record that existed beforehand, if any, so the
    /// caller can decide whether a prior connection needs to be force-closed.
    async fn upsert_session(
        &self,
        session_id: &str,
        connection_id: &str,
        now_ms: u64,
    ) -> BResult<Option<Session>>;

    async fn get_session(&self, session_id: &str) -> BResult<Option<Session>>;

    async fn touch_session(&self, session_id: &str, now_ms: u64) -> BResult<()>;

    async fn set_session_room(&self, session_id: &str, room_id: &str) -> BResult<()>;

    async fn clear_session_room(&self, session_id: &str) -> BResult<()>;

    async fn remove_session(&self, session_id: &str) -> BResult<()>;

    async fn session_count(&self) -> BResult<usize>;

    /// Sessions whose `last_seen_at` is older than `cutoff_ms`. Used by the
    /// expiry sweeper (§4.G); never used on the hot path.
    async fn sessions_older_than(&self, cutoff_ms: u64) -> BResult<Vec<Session>>;

    // ---- rate limiter (§4.C) ----

    /// Fixed-window check-and-increment. Returns `true` if the message is
    /// allowed (and the counter has been incremented / reset accordingly).
    async fn rate_check(
        &self,
        session_id: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> BResult<bool>;

    async fn rate_clear(&self, session_id: &str) -> BResult<()>;

    // ---- invite store (§4.D) ----

    /// Installs `invite:{code}` and `inviteBySession:{sessionId}` atomically,
    /// both with `ttl_ms`, only if the forward key is absent. Returns `false`
    /// on a collision (caller retries with a different code).
    async fn invite_try_create(&self, code: &str, record: InviteRecord, ttl_ms: u64)
        -> BResult<bool>;

    /// Atomically reads and deletes both the forward and reverse keys.
    async fn invite_redeem(&self, code: &str) -> BResult<Option<InviteRecord>>;

    /// Looks up the reverse index and deletes both keys. Returns whether an
    /// invite existed.
    async fn invite_cancel_by_session(&self, session_id: &str) -> BResult<bool>;

    async fn invite_has(&self, session_id: &str) -> BResult<bool>;

    // ---- matchmaking queue (§4.E) ----

    async fn queue_contains(&self, session_id: &str) -> BResult<bool>;

    async fn queue_push(&self, session_id: &str, connection_id: &str) -> BResult<()>;

    /// Pops the oldest waiter, if any. Does not re-check liveness — that's
    /// the matchmaker's job, since it alone knows how to consult the session
    /// registry.
    async fn queue_pop_front(&self) -> BResult<Option<QueueWaiter>>;

    /// Removes every occurrence of `session_id` from the queue (idempotent;
    /// a no-op if absent).
    async fn queue_remove(&self, session_id: &str) -> BResult<()>;

    async fn queue_len(&self) -> BResult<usize>;

    // ---- rooms (§4.E) ----

    async fn room_get(&self, room_id: &str) -> BResult<Option<Room>>;

    async fn room_by_session(&self, session_id: &str) -> BResult<Option<String>>;

    /// Installs a fully-formed room plus both reverse indices and both
    /// session→room bindings as one logical transaction.
    async fn room_install(&self, room: Room) -> BResult<()>;

    /// Clears the room record, both reverse indices, the room set entry, and
    /// both session bindings. Idempotent.
    async fn room_destroy(&self, room_id: &str) -> BResult<()>;

    async fn room_count(&self) -> BResult<usize>;
}
