//! Session registry (§4.B): who's connected, and from where.

use std::sync::Arc;

use crate::backend::StateBackend;
use crate::error::DResult;
use crate::model::{now_ms, Session};

pub struct SessionRegistry {
    backend: Arc<dyn StateBackend>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Upserts `(session_id, connection_id)`. Returns the prior session
    /// record, if any — the caller (the `join` handler) is responsible for
    /// force-closing a prior connection when this is `Some` with a different
    /// `connection_id`.
    pub async fn add_session(&self, session_id: &str, connection_id: &str) -> DResult<Option<Session>> {
        Ok(self
            .backend
            .upsert_session(session_id, connection_id, now_ms())
            .await?)
    }

    pub async fn get_session(&self, session_id: &str) -> DResult<Option<Session>> {
        Ok(self.backend.get_session(session_id).await?)
    }

    pub async fn touch(&self, session_id: &str) -> DResult<()> {
        self.backend.touch_session(session_id, now_ms()).await?;
        Ok(())
    }

    pub async fn remove_session(&self, session_id: &str) -> DResult<()> {
        self.backend.remove_session(session_id).await?;
        Ok(())
    }

    pub async fn session_count(&self) -> DResult<usize> {
        Ok(self.backend.session_count().await?)
    }

    pub async fn expired_sessions(&self, ttl_ms: u64) -> DResult<Vec<Session>> {
        let cutoff = now_ms().saturating_sub(ttl_ms);
        Ok(self.backend.sessions_older_than(cutoff).await?)
    }
}
