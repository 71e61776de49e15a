//! In-process state backend: a single coarse lock over every index.
//!
//! §4.A permits either "a single coordinating lock, or per-index locks
//! acquired in fixed order"; a single lock is simpler and, per §5, cheap
//! enough here since contention across sessions is low and every operation
//! below is O(n) in the size of its own index at worst, never blocking on
//! I/O. All `async fn` below resolve without a real suspension point, as the
//! spec requires of the local mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{QueueWaiter, StateBackend};
use crate::error::BResult;
use crate::model::{InviteRecord, Room, Session};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    rooms: HashMap<String, Room>,
    room_by_session: HashMap<String, String>,
    queue: VecDeque<(String, String)>,
    queue_set: HashSet<String>,
    invites: HashMap<String, (InviteRecord, u64)>, // code -> (record, expires_at_ms)
    invite_by_session: HashMap<String, (String, u64)>, // session -> (code, expires_at_ms)
    rate: HashMap<String, (u32, u64)>,             // session -> (count, window_start_ms)
}

pub struct LocalBackend {
    inner: Mutex<Inner>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn expire_invite_if_due(inner: &mut Inner, code: &str, now_ms: u64) {
        let expired = matches!(inner.invites.get(code), Some((_, exp)) if *exp <= now_ms);
        if expired {
            if let Some((record, _)) = inner.invites.remove(code) {
                inner.invite_by_session.remove(&record.session_id);
            }
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn upsert_session(
        &self,
        session_id: &str,
        connection_id: &str,
        now_ms: u64,
    ) -> BResult<Option<Session>> {
        let mut g = self.inner.lock().unwrap();
        let prior = g.sessions.get(session_id).cloned();
        let room_id = prior.as_ref().and_then(|s| s.room_id.clone());
        g.sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                connection_id: connection_id.to_string(),
                room_id,
                created_at: prior.as_ref().map(|s| s.created_at).unwrap_or(now_ms),
                last_seen_at: now_ms,
            },
        );
        Ok(prior)
    }

    async fn get_session(&self, session_id: &str) -> BResult<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(session_id).cloned())
    }

    async fn touch_session(&self, session_id: &str, now_ms: u64) -> BResult<()> {
        if let Some(s) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            s.last_seen_at = now_ms;
        }
        Ok(())
    }

    async fn set_session_room(&self, session_id: &str, room_id: &str) -> BResult<()> {
        if let Some(s) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            s.room_id = Some(room_id.to_string());
        }
        Ok(())
    }

    async fn clear_session_room(&self, session_id: &str) -> BResult<()> {
        if let Some(s) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            s.room_id = None;
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: &str) -> BResult<()> {
        self.inner.lock().unwrap().sessions.remove(session_id);
        Ok(())
    }

    async fn session_count(&self) -> BResult<usize> {
        Ok(self.inner.lock().unwrap().sessions.len())
    }

    async fn sessions_older_than(&self, cutoff_ms: u64) -> BResult<Vec<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.last_seen_at < cutoff_ms)
            .cloned()
            .collect())
    }

    async fn rate_check(
        &self,
        session_id: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> BResult<bool> {
        let mut g = self.inner.lock().unwrap();
        let entry = g.rate.get(session_id).copied();
        let allowed = match entry {
            None => {
                g.rate.insert(session_id.to_string(), (1, now_ms));
                true
            }
            Some((count, window_start)) if now_ms.saturating_sub(window_start) > window_ms => {
                g.rate.insert(session_id.to_string(), (1, now_ms));
                true
            }
            Some((count, window_start)) if count >= limit => {
                let _ = window_start;
                false
            }
            Some((count, window_start)) => {
                g.rate
                    .insert(session_id.to_string(), (count + 1, window_start));
                true
            }
        };
        Ok(allowed)
    }

    async fn rate_clear(&self, session_id: &str) -> BResult<()> {
        self.inner.lock().unwrap().rate.remove(session_id);
        Ok(())
    }

    async fn invite_try_create(
        &self,
        code: &str,
        record: InviteRecord,
        ttl_ms: u64,
    ) -> BResult<bool> {
        let mut g = self.inner.lock().unwrap();
        let now = crate::model::now_ms();
        Self::expire_invite_if_due(&mut g, code, now);
        if g.invites.contains_key(code) {
            return Ok(false);
        }
        let expires_at = now + ttl_ms;
        g.invite_by_session
            .insert(record.session_id.clone(), (code.to_string(), expires_at));
        g.invites.insert(code.to_string(), (record, expires_at));
        Ok(true)
    }

    async fn invite_redeem(&self, code: &str) -> BResult<Option<InviteRecord>> {
        let mut g = self.inner.lock().unwrap();
        let now = crate::model::now_ms();
        Self::expire_invite_if_due(&mut g, code, now);
        match g.invites.remove(code) {
            Some((record, _)) => {
                g.invite_by_session.remove(&record.session_id);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn invite_cancel_by_session(&self, session_id: &str) -> BResult<bool> {
        let mut g = self.inner.lock().unwrap();
        match g.invite_by_session.remove(session_id) {
            Some((code, _)) => {
                g.invites.remove(&code);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn invite_has(&self, session_id: &str) -> BResult<bool> {
        let mut g = self.inner.lock().unwrap();
        let now = crate::model::now_ms();
        if let Some((code, exp)) = g.invite_by_session.get(session_id).cloned() {
            if exp <= now {
                g.invite_by_session.remove(session_id);
                g.invites.remove(&code);
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn queue_contains(&self, session_id: &str) -> BResult<bool> {
        Ok(self.inner.lock().unwrap().queue_set.contains(session_id))
    }

    async fn queue_push(&self, session_id: &str, connection_id: &str) -> BResult<()> {
        let mut g = self.inner.lock().unwrap();
        if g.queue_set.insert(session_id.to_string()) {
            g.queue.push_back((session_id.to_string(), connection_id.to_string()));
        }
        Ok(())
    }

    async fn queue_pop_front(&self) -> BResult<Option<QueueWaiter>> {
        let mut g = self.inner.lock().unwrap();
        match g.queue.pop_front() {
            Some((sid, cid)) => {
                g.queue_set.remove(&sid);
                Ok(Some((sid, cid)))
            }
            None => Ok(None),
        }
    }

    async fn queue_remove(&self, session_id: &str) -> BResult<()> {
        let mut g = self.inner.lock().unwrap();
        g.queue.retain(|(sid, _)| sid != session_id);
        g.queue_set.remove(session_id);
        Ok(())
    }

    async fn queue_len(&self) -> BResult<usize> {
        Ok(self.inner.lock().unwrap().queue.len())
    }

    async fn room_get(&self, room_id: &str) -> BResult<Option<Room>> {
        Ok(self.inner.lock().unwrap().rooms.get(room_id).cloned())
    }

    async fn room_by_session(&self, session_id: &str) -> BResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .room_by_session
            .get(session_id)
            .cloned())
    }

    async fn room_install(&self, room: Room) -> BResult<()> {
        let mut g = self.inner.lock().unwrap();
        g.room_by_session
            .insert(room.session1.session_id.clone(), room.room_id.clone());
        g.room_by_session
            .insert(room.session2.session_id.clone(), room.room_id.clone());
        if let Some(s) = g.sessions.get_mut(&room.session1.session_id) {
            s.room_id = Some(room.room_id.clone());
        }
        if let Some(s) = g.sessions.get_mut(&room.session2.session_id) {
            s.room_id = Some(room.room_id.clone());
        }
        g.rooms.insert(room.room_id.clone(), room);
        Ok(())
    }

    async fn room_destroy(&self, room_id: &str) -> BResult<()> {
        let mut g = self.inner.lock().unwrap();
        if let Some(room) = g.rooms.remove(room_id) {
            g.room_by_session.remove(&room.session1.session_id);
            g.room_by_session.remove(&room.session2.session_id);
            if let Some(s) = g.sessions.get_mut(&room.session1.session_id) {
                s.room_id = None;
            }
            if let Some(s) = g.sessions.get_mut(&room.session2.session_id) {
                s.room_id = None;
            }
        }
        Ok(())
    }

    async fn room_count(&self) -> BResult<usize> {
        Ok(self.inner.lock().unwrap().rooms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_ms;

    #[tokio::test]
    async fn upsert_returns_prior_session() {
        let b = LocalBackend::new();
        assert!(b.upsert_session("a", "c1", now_ms()).await.unwrap().is_none());
        let prior = b.upsert_session("a", "c2", now_ms()).await.unwrap();
        assert_eq!(prior.unwrap().connection_id, "c1");
    }

    #[tokio::test]
    async fn queue_dedupes_membership() {
        let b = LocalBackend::new();
        b.queue_push("a", "c1").await.unwrap();
        b.queue_push("a", "c1").await.unwrap();
        assert_eq!(b.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let b = LocalBackend::new();
        b.queue_push("a", "c1").await.unwrap();
        b.queue_push("b", "c2").await.unwrap();
        let (first, _) = b.queue_pop_front().await.unwrap().unwrap();
        assert_eq!(first, "a");
        let (second, _) = b.queue_pop_front().await.unwrap().unwrap();
        assert_eq!(second, "b");
    }

    #[tokio::test]
    async fn room_install_and_destroy_clears_reverse_indices() {
        let b = LocalBackend::new();
        b.upsert_session("a", "c1", now_ms()).await.unwrap();
        b.upsert_session("b", "c2", now_ms()).await.unwrap();
        let room = Room {
            room_id: "r1".into(),
            session1: crate::model::RoomMember {
                session_id: "a".into(),
                connection_id: "c1".into(),
            },
            session2: crate::model::RoomMember {
                session_id: "b".into(),
                connection_id: "c2".into(),
            },
        };
        b.room_install(room).await.unwrap();
        assert_eq!(b.room_by_session("a").await.unwrap(), Some("r1".into()));
        assert_eq!(
            b.get_session("a").await.unwrap().unwrap().room_id,
            Some("r1".into())
        );

        b.room_destroy("r1").await.unwrap();
        assert!(b.room_by_session("a").await.unwrap().is_none());
        assert!(b.get_session("a").await.unwrap().unwrap().room_id.is_none());
        // idempotent
        b.room_destroy("r1").await.unwrap();
    }

    #[tokio::test]
    async fn invite_redeem_is_one_shot() {
        let b = LocalBackend::new();
        let record = InviteRecord {
            session_id: "a".into(),
            connection_id: "c1".into(),
            created_at: now_ms(),
        };
        assert!(b
            .invite_try_create("TALK-AAAA", record.clone(), 300_000)
            .await
            .unwrap());
        assert!(!b
            .invite_try_create("TALK-AAAA", record, 300_000)
            .await
            .unwrap());
        assert!(b.invite_redeem("TALK-AAAA").await.unwrap().is_some());
        assert!(b.invite_redeem("TALK-AAAA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_window() {
        let b = LocalBackend::new();
        let start = 1_000_000u64;
        for _ in 0..30 {
            assert!(b.rate_check("a", start, 60_000, 30).await.unwrap());
        }
        assert!(!b.rate_check("a", start + 1_000, 60_000, 30).await.unwrap());
        assert!(b
            .rate_check("a", start + 61_000, 60_000, 30)
            .await
            .unwrap());
    }
}
