//! FIFO matchmaking queue and 2-party rooms (§4.E).

use std::sync::Arc;
use uuid::Uuid;

use crate::backend::StateBackend;
use crate::error::DResult;
use crate::model::{Room, RoomMember};

/// How many stale waiters `join_queue` will discard before giving up and
/// enqueuing the caller instead.
const MAX_POP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinQueueOutcome {
    Matched(Room),
    Waiting,
    AlreadyQueued,
}

pub struct Matchmaker {
    backend: Arc<dyn StateBackend>,
}

impl Matchmaker {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn is_in_queue(&self, session_id: &str) -> DResult<bool> {
        Ok(self.backend.queue_contains(session_id).await?)
    }

    pub async fn leave_queue(&self, session_id: &str) -> DResult<()> {
        self.backend.queue_remove(session_id).await?;
        Ok(())
    }

    /// Attempts to pair `session_id` with the oldest viable waiter; falls
    /// back to enqueuing it. See §4.E for the exact bounded-retry algorithm.
    pub async fn join_queue(&self, session_id: &str, connection_id: &str) -> DResult<JoinQueueOutcome> {
        if self.backend.queue_contains(session_id).await? {
            return Ok(JoinQueueOutcome::AlreadyQueued);
        }

        for _ in 0..MAX_POP_ATTEMPTS {
            let (other_id, _stale_conn) = match self.backend.queue_pop_front().await? {
                Some(w) => w,
                None => break,
            };

            if other_id == session_id {
                continue;
            }

            let other_session = match self.backend.get_session(&other_id).await? {
                Some(s) => s,
                None => continue, // session no longer exists: discard
            };
            if other_session.room_id.is_some() {
                continue; // already in a room: discard
            }

            let room = Room {
                room_id: Uuid::new_v4().to_string(),
                session1: RoomMember {
                    session_id: session_id.to_string(),
                    connection_id: connection_id.to_string(),
                },
                session2: RoomMember {
                    session_id: other_id,
                    connection_id: other_session.connection_id,
                },
            };
            self.backend.room_install(room.clone()).await?;
            return Ok(JoinQueueOutcome::Matched(room));
        }

        self.backend.queue_push(session_id, connection_id).await?;
        Ok(JoinQueueOutcome::Waiting)
    }

    pub async fn get_room(&self, room_id: &str) -> DResult<Option<Room>> {
        Ok(self.backend.room_get(room_id).await?)
    }

    pub async fn get_room_by_session(&self, session_id: &str) -> DResult<Option<Room>> {
        match self.backend.room_by_session(session_id).await? {
            Some(room_id) => Ok(self.backend.room_get(&room_id).await?),
            None => Ok(None),
        }
    }

    /// The peer's *current* connection id, falling back to the id recorded
    /// in the room if the peer session has gone live-less. `None` if
    /// `session_id` is not actually a member of `room_id`.
    pub async fn get_peer_connection_id(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> DResult<Option<String>> {
        let room = match self.backend.room_get(room_id).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let peer = match room.other(session_id) {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        let live = self
            .backend
            .get_session(&peer.session_id)
            .await?
            .map(|s| s.connection_id);
        Ok(Some(live.unwrap_or(peer.connection_id)))
    }

    pub async fn install_room(&self, room: Room) -> DResult<()> {
        self.backend.room_install(room).await?;
        Ok(())
    }

    pub async fn destroy_room(&self, room_id: &str) -> DResult<()> {
        self.backend.room_destroy(room_id).await?;
        Ok(())
    }

    pub async fn queue_len(&self) -> DResult<usize> {
        Ok(self.backend.queue_len().await?)
    }

    pub async fn room_count(&self) -> DResult<usize> {
        Ok(self.backend.room_count().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::model::now_ms;

    async fn matchmaker_with_sessions(ids: &[&str]) -> (Matchmaker, Arc<dyn StateBackend>) {
        let backend: Arc<dyn StateBackend> = Arc::new(LocalBackend::new());
        for id in ids {
            backend
                .upsert_session(id, &format!("{id}-conn"), now_ms())
                .await
                .unwrap();
        }
        (Matchmaker::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn first_waiter_waits_second_matches() {
        let (mm, _backend) = matchmaker_with_sessions(&["a", "b"]).await;
        let first = mm.join_queue("a", "a-conn").await.unwrap();
        assert_eq!(first, JoinQueueOutcome::Waiting);

        let second = mm.join_queue("b", "b-conn").await.unwrap();
        match second {
            JoinQueueOutcome::Matched(room) => {
                assert!(room.contains("a"));
                assert!(room.contains("b"));
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert!(!mm.is_in_queue("a").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_join_queue_is_a_noop() {
        let (mm, _backend) = matchmaker_with_sessions(&["a"]).await;
        assert_eq!(
            mm.join_queue("a", "a-conn").await.unwrap(),
            JoinQueueOutcome::Waiting
        );
        assert_eq!(
            mm.join_queue("a", "a-conn").await.unwrap(),
            JoinQueueOutcome::AlreadyQueued
        );
    }

    #[tokio::test]
    async fn stale_waiter_is_discarded() {
        let (mm, backend) = matchmaker_with_sessions(&["b"]).await;
        // "ghost" has never registered a session; it's in the queue but has
        // no session record at all, simulating a disconnect race.
        backend.queue_push("ghost", "ghost-conn").await.unwrap();
        let outcome = mm.join_queue("b", "b-conn").await.unwrap();
        assert_eq!(outcome, JoinQueueOutcome::Waiting);
        assert!(!mm.is_in_queue("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn destroy_room_clears_all_indices_and_is_idempotent() {
        let (mm, backend) = matchmaker_with_sessions(&["a", "b"]).await;
        mm.join_queue("a", "a-conn").await.unwrap();
        let outcome = mm.join_queue("b", "b-conn").await.unwrap();
        let room = match outcome {
            JoinQueueOutcome::Matched(r) => r,
            _ => panic!("expected match"),
        };
        mm.destroy_room(&room.room_id).await.unwrap();
        assert!(backend.room_get(&room.room_id).await.unwrap().is_none());
        assert!(backend.room_by_session("a").await.unwrap().is_none());
        assert!(backend
            .get_session("a")
            .await
            .unwrap()
            .unwrap()
            .room_id
            .is_none());
        // idempotent
        mm.destroy_room(&room.room_id).await.unwrap();
    }
}
