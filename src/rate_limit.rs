//! Per-session fixed-window rate limiter (§4.C).
//!
//! A courtesy limit, not a security boundary: see the shared backend's
//! non-atomic read-modify-write for the tradeoff this implies under
//! `shared-backend` mode.

use std::sync::Arc;

use crate::backend::StateBackend;
use crate::error::DResult;
use crate::model::now_ms;

pub const WINDOW_MS: u64 = 60_000;
pub const LIMIT: u32 = 30;

pub struct RateLimiter {
    backend: Arc<dyn StateBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn is_allowed(&self, session_id: &str) -> DResult<bool> {
        Ok(self
            .backend
            .rate_check(session_id, now_ms(), WINDOW_MS, LIMIT)
            .await?)
    }

    pub async fn clear(&self, session_id: &str) -> DResult<()> {
        self.backend.rate_clear(session_id).await?;
        Ok(())
    }
}
