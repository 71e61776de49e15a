//! Shared state backend on top of Redis.
//!
//! Every multi-key mutation that must be linearisable (invite issuance, room
//! install/destroy) goes through a small embedded Lua script run with
//! `EVAL`, which Redis executes atomically with respect to all other
//! commands — the shared-mode analogue of the local backend's single lock.
//! Everything else is a handful of ordinary commands; per §4.C the rate
//! limiter's read-modify-write is deliberately *not* wrapped in a
//! transaction (a courtesy limit, not a security boundary, and the
//! occasional overshoot this allows is an accepted tradeoff).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::backend::{QueueWaiter, StateBackend};
use crate::error::BackendError;
use crate::error::BResult;
use crate::model::{InviteRecord, Room, Session};

fn key_session(session_id: &str) -> String {
    format!("session:{session_id}")
}
fn key_sessions_by_last_seen() -> &'static str {
    "sessions:byLastSeen"
}
fn key_invite(code: &str) -> String {
    format!("invite:{code}")
}
fn key_invite_by_session(session_id: &str) -> String {
    format!("inviteBySession:{session_id}")
}
fn key_rate(session_id: &str) -> String {
    format!("rate:{session_id}")
}
fn key_queue_list() -> &'static str {
    "queue:list"
}
fn key_queue_set() -> &'static str {
    "queue:set"
}
fn key_room(room_id: &str) -> String {
    format!("room:{room_id}")
}
fn key_rooms_set() -> &'static str {
    "rooms:set"
}
fn key_room_by_session(session_id: &str) -> String {
    format!("roomBySession:{session_id}")
}

fn to_backend_err(e: redis::RedisError) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> BResult<Self> {
        let client = redis::Client::open(redis_url).map_err(to_backend_err)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(to_backend_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateBackend for RedisBackend {
    async fn upsert_session(
        &self,
        session_id: &str,
        connection_id: &str,
        now_ms: u64,
    ) -> BResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key_session(session_id)).await.map_err(to_backend_err)?;
        let prior = raw
            .as_ref()
            .and_then(|s| serde_json::from_str::<Session>(s).ok());
        let created_at = prior.as_ref().map(|s| s.created_at).unwrap_or(now_ms);
        let room_id = prior.as_ref().and_then(|s| s.room_id.clone());
        let session = Session {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
            room_id,
            created_at,
            last_seen_at: now_ms,
        };
        let encoded = serde_json::to_string(&session)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let _: () = conn.set(key_session(session_id), encoded).await.map_err(to_backend_err)?;
        let _: () = conn
            .zadd(key_sessions_by_last_seen(), session_id, now_ms as f64)
            .await
            .map_err(to_backend_err)?;
        Ok(prior)
    }

    async fn get_session(&self, session_id: &str) -> BResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key_session(session_id)).await.map_err(to_backend_err)?;
        match raw {
            Some(s) => Ok(Some(
                serde_json::from_str(&s).map_err(|e| BackendError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, session_id: &str, now_ms: u64) -> BResult<()> {
        if let Some(mut session) = self.get_session(session_id).await? {
            session.last_seen_at = now_ms;
            let mut conn = self.conn.clone();
            let encoded = serde_json::to_string(&session)
                .map_err(|e| BackendError::Corrupt(e.to_string()))?;
            let _: () = conn.set(key_session(session_id), encoded).await.map_err(to_backend_err)?;
            let _: () = conn
                .zadd(key_sessions_by_last_seen(), session_id, now_ms as f64)
                .await
                .map_err(to_backend_err)?;
        }
        Ok(())
    }

    async fn set_session_room(&self, session_id: &str, room_id: &str) -> BResult<()> {
        if let Some(mut session) = self.get_session(session_id).await? {
            session.room_id = Some(room_id.to_string());
            let mut conn = self.conn.clone();
            let encoded = serde_json::to_string(&session)
                .map_err(|e| BackendError::Corrupt(e.to_string()))?;
            let _: () = conn.set(key_session(session_id), encoded).await.map_err(to_backend_err)?;
        }
        Ok(())
    }

    async fn clear_session_room(&self, session_id: &str) -> BResult<()> {
        if let Some(mut session) = self.get_session(session_id).await? {
            session.room_id = None;
            let mut conn = self.conn.clone();
            let encoded = serde_json::to_string(&session)
                .map_err(|e| BackendError::Corrupt(e.to_string()))?;
            let _: () = conn.set(key_session(session_id), encoded).await.map_err(to_backend_err)?;
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: &str) -> BResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key_session(session_id)).await.map_err(to_backend_err)?;
        let _: () = conn
            .zrem(key_sessions_by_last_seen(), session_id)
            .await
            .map_err(to_backend_err)?;
        Ok(())
    }

    async fn session_count(&self) -> BResult<usize> {
        let mut conn = self.conn.clone();
        let n: usize = conn
            .zcard(key_sessions_by_last_seen())
            .await
            .map_err(to_backend_err)?;
        Ok(n)
    }

    async fn sessions_older_than(&self, cutoff_ms: u64) -> BResult<Vec<Session>> {
        let mut conn = self.conn.clone();
        let stale_ids: Vec<String> = conn
            .zrangebyscore(key_sessions_by_last_seen(), 0, cutoff_ms as f64 - 1.0)
            .await
            .map_err(to_backend_err)?;
        let mut out = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(s) = self.get_session(&id).await? {
                out.push(s);
            }
        }
        Ok(out)
    }

    async fn rate_check(
        &self,
        session_id: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> BResult<bool> {
        // Deliberately non-atomic read-modify-write (§4.C): this is a
        // courtesy limit, and the shared backend's goal is low overhead, not
        // exactness.
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key_rate(session_id)).await.map_err(to_backend_err)?;
        let current = raw.and_then(|s| serde_json::from_str::<(u32, u64)>(&s).ok());
        let (count, window_start, allowed) = match current {
            None => (1, now_ms, true),
            Some((_, window_start)) if now_ms.saturating_sub(window_start) > window_ms => {
                (1, now_ms, true)
            }
            Some((count, window_start)) if count >= limit => (count, window_start, false),
            Some((count, window_start)) => (count + 1, window_start, true),
        };
        let encoded = serde_json::to_string(&(count, window_start))
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let _: () = conn.set(key_rate(session_id), encoded).await.map_err(to_backend_err)?;
        Ok(allowed)
    }

    async fn rate_clear(&self, session_id: &str) -> BResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key_rate(session_id)).await.map_err(to_backend_err)?;
        Ok(())
    }

    async fn invite_try_create(
        &self,
        code: &str,
        record: InviteRecord,
        ttl_ms: u64,
    ) -> BResult<bool> {
        let encoded = serde_json::to_string(&record)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let ttl_secs = (ttl_ms / 1000).max(1);
        let script = Script::new(
            r"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
            redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
            return 1
            ",
        );
        let mut conn = self.conn.clone();
        let created: i32 = script
            .key(key_invite(code))
            .key(key_invite_by_session(&record.session_id))
            .arg(encoded)
            .arg(code)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        Ok(created == 1)
    }

    async fn invite_redeem(&self, code: &str) -> BResult<Option<InviteRecord>> {
        let script = Script::new(
            r"
            local raw = redis.call('GET', KEYS[1])
            if not raw then
                return false
            end
            redis.call('DEL', KEYS[1])
            redis.call('DEL', KEYS[2])
            return raw
            ",
        );
        // The reverse-index key depends on the record's sessionId, which we
        // only know after reading the forward key. Read first to discover
        // it, then run a script that re-checks and deletes both keys
        // atomically — the race where the code expires between the peek and
        // the script is harmless, since the script simply finds it gone.
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key_invite(code)).await.map_err(to_backend_err)?;
        let record: InviteRecord = match raw {
            Some(s) => serde_json::from_str(&s).map_err(|e| BackendError::Corrupt(e.to_string()))?,
            None => return Ok(None),
        };
        let reverse_key = key_invite_by_session(&record.session_id);
        let result: Option<String> = script
            .key(key_invite(code))
            .key(reverse_key)
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        match result {
            Some(s) => Ok(Some(
                serde_json::from_str(&s).map_err(|e| BackendError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn invite_cancel_by_session(&self, session_id: &str) -> BResult<bool> {
        let mut conn = self.conn.clone();
        let code: Option<String> = conn
            .get(key_invite_by_session(session_id))
            .await
            .map_err(to_backend_err)?;
        match code {
            Some(code) => {
                let _: () = conn.del(key_invite(&code)).await.map_err(to_backend_err)?;
                let _: () = conn
                    .del(key_invite_by_session(session_id))
                    .await
                    .map_err(to_backend_err)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn invite_has(&self, session_id: &str) -> BResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(key_invite_by_session(session_id))
            .await
            .map_err(to_backend_err)?;
        Ok(exists)
    }

    async fn queue_contains(&self, session_id: &str) -> BResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .sismember(key_queue_set(), session_id)
            .await
            .map_err(to_backend_err)?;
        Ok(exists)
    }

    async fn queue_push(&self, session_id: &str, _connection_id: &str) -> BResult<()> {
        let script = Script::new(
            r"
            if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
                return 0
            end
            redis.call('SADD', KEYS[1], ARGV[1])
            redis.call('RPUSH', KEYS[2], ARGV[1])
            return 1
            ",
        );
        let mut conn = self.conn.clone();
        let _: i32 = script
            .key(key_queue_set())
            .key(key_queue_list())
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        Ok(())
    }

    async fn queue_pop_front(&self) -> BResult<Option<QueueWaiter>> {
        let mut conn = self.conn.clone();
        let session_id: Option<String> = conn.lpop(key_queue_list(), None).await.map_err(to_backend_err)?;
        let session_id = match session_id {
            Some(s) => s,
            None => return Ok(None),
        };
        let _: () = conn
            .srem(key_queue_set(), &session_id)
            .await
            .map_err(to_backend_err)?;
        // The queue only records session ids (matching the documented key
        // layout); the live connection id is read back from the session
        // registry, which the matchmaker consults anyway for a liveness check.
        let connection_id = self
            .get_session(&session_id)
            .await?
            .map(|s| s.connection_id)
            .unwrap_or_default();
        Ok(Some((session_id, connection_id)))
    }

    async fn queue_remove(&self, session_id: &str) -> BResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(key_queue_list(), 0, session_id)
            .await
            .map_err(to_backend_err)?;
        let _: () = conn.srem(key_queue_set(), session_id).await.map_err(to_backend_err)?;
        Ok(())
    }

    async fn queue_len(&self) -> BResult<usize> {
        let mut conn = self.conn.clone();
        let n: usize = conn.llen(key_queue_list()).await.map_err(to_backend_err)?;
        Ok(n)
    }

    async fn room_get(&self, room_id: &str) -> BResult<Option<Room>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key_room(room_id)).await.map_err(to_backend_err)?;
        match raw {
            Some(s) => Ok(Some(
                serde_json::from_str(&s).map_err(|e| BackendError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn room_by_session(&self, session_id: &str) -> BResult<Option<String>> {
        let mut conn = self.conn.clone();
        let room_id: Option<String> = conn
            .get(key_room_by_session(session_id))
            .await
            .map_err(to_backend_err)?;
        Ok(room_id)
    }

    async fn room_install(&self, room: Room) -> BResult<()> {
        let encoded_room =
            serde_json::to_string(&room).map_err(|e| BackendError::Corrupt(e.to_string()))?;

        let script = Script::new(
            r"
            redis.call('SET', KEYS[1], ARGV[1])
            redis.call('SADD', KEYS[2], ARGV[2])
            redis.call('SET', KEYS[3], ARGV[2])
            redis.call('SET', KEYS[4], ARGV[2])
            return 1
            ",
        );
        let mut conn = self.conn.clone();
        let _: i32 = script
            .key(key_room(&room.room_id))
            .key(key_rooms_set())
            .key(key_room_by_session(&room.session1.session_id))
            .key(key_room_by_session(&room.session2.session_id))
            .arg(encoded_room)
            .arg(&room.room_id)
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;

        // Session records are plain JSON blobs, not Redis hashes, so the
        // `roomId` binding on each session goes through the ordinary session
        // API. Both writes land before `matched` is ever emitted to either
        // party (the dispatcher awaits `room_install` before publishing).
        self.set_session_room(&room.session1.session_id, &room.room_id)
            .await?;
        self.set_session_room(&room.session2.session_id, &room.room_id)
            .await?;
        Ok(())
    }

    async fn room_destroy(&self, room_id: &str) -> BResult<()> {
        let room = match self.room_get(room_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let mut conn = self.conn.clone();
        let _: () = conn.del(key_room(room_id)).await.map_err(to_backend_err)?;
        let _: () = conn.srem(key_rooms_set(), room_id).await.map_err(to_backend_err)?;
        let _: () = conn
            .del(key_room_by_session(&room.session1.session_id))
            .await
            .map_err(to_backend_err)?;
        let _: () = conn
            .del(key_room_by_session(&room.session2.session_id))
            .await
            .map_err(to_backend_err)?;
        self.clear_session_room(&room.session1.session_id).await?;
        self.clear_session_room(&room.session2.session_id).await?;
        Ok(())
    }

    async fn room_count(&self) -> BResult<usize> {
        let mut conn = self.conn.clone();
        let n: usize = conn.scard(key_rooms_set()).await.map_err(to_backend_err)?;
        Ok(n)
    }
}
