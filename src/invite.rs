//! One-time invite codes (§4.D).

use std::sync::Arc;

use rand::Rng;

use crate::backend::StateBackend;
use crate::error::{DResult, DispatchError, InviteError};
use crate::model::{now_ms, InviteRecord};

pub const TTL_MS: u64 = 5 * 60 * 1000;
const MAX_ATTEMPTS: u32 = 10;
const CODE_CHARS: &[u8] = b"0123456789ABCDEF";

pub struct InviteStore {
    backend: Arc<dyn StateBackend>,
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
        .collect();
    format!("TALK-{suffix}")
}

/// Normalises a client-supplied code: trim whitespace, upper-case. Applied
/// before every lookup so redemption is case-insensitive at the edges.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

impl InviteStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn create(&self, session_id: &str, connection_id: &str) -> Result<String, InviteError> {
        let record = InviteRecord {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
            created_at: now_ms(),
        };
        for _ in 0..MAX_ATTEMPTS {
            let code = random_code();
            if self
                .backend
                .invite_try_create(&code, record.clone(), TTL_MS)
                .await?
            {
                return Ok(code);
            }
        }
        Err(InviteError::AllocationExhausted)
    }

    /// Redeems `raw_code` after normalising it. A missing or expired invite
    /// is surfaced identically (§7: no oracle leak distinguishing the two).
    pub async fn redeem(&self, raw_code: &str) -> DResult<InviteRecord> {
        let code = normalize_code(raw_code);
        self.backend
            .invite_redeem(&code)
            .await?
            .ok_or_else(|| DispatchError::NotFound("Invite code not found or expired".to_string()))
    }

    pub async fn cancel(&self, session_id: &str) -> DResult<bool> {
        Ok(self.backend.invite_cancel_by_session(session_id).await?)
    }

    pub async fn has_invite(&self, session_id: &str) -> DResult<bool> {
        Ok(self.backend.invite_has(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(normalize_code("  talk-ab12 "), "TALK-AB12");
    }

    #[tokio::test]
    async fn create_then_redeem_roundtrips() {
        let store = InviteStore::new(Arc::new(LocalBackend::new()));
        let code = store.create("alice", "c1").await.unwrap();
        assert!(code.starts_with("TALK-"));
        let record = store.redeem(&code).await.unwrap();
        assert_eq!(record.session_id, "alice");
    }

    #[tokio::test]
    async fn redeem_is_one_shot() {
        let store = InviteStore::new(Arc::new(LocalBackend::new()));
        let code = store.create("alice", "c1").await.unwrap();
        store.redeem(&code).await.unwrap();
        let err = store.redeem(&code).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn redeem_is_case_insensitive() {
        let store = InviteStore::new(Arc::new(LocalBackend::new()));
        let code = store.create("alice", "c1").await.unwrap();
        let lower = code.to_ascii_lowercase();
        let record = store.redeem(&format!("  {lower}  ")).await.unwrap();
        assert_eq!(record.session_id, "alice");
    }
}
