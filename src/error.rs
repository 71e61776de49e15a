//! Error taxonomy for the relay core.
//!
//! Mirrors the per-concern-enum-plus-umbrella-enum shape used throughout this
//! codebase: small `thiserror` enums close to where they're raised, folded
//! into [`DispatchError`] via hand-written `From` impls (not `#[from]` —
//! see the impls below for why) at the point where an event handler needs
//! to turn *any* failure into a client-facing `error` event.

use thiserror::Error;

/// Failures from a [`crate::backend::StateBackend`] implementation. Always
/// surfaced to clients as a generic message — never logged with backend
/// internals that might look like message content.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned malformed data: {0}")]
    Corrupt(String),
}

/// Failures specific to invite issuance.
#[derive(Error, Debug)]
pub enum InviteError {
    #[error("could not allocate a unique invite code")]
    AllocationExhausted,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The single error type every event handler in [`crate::dispatch`] resolves
/// to. Its `Display` impl is, verbatim, the message sent to the client in an
/// `error` event — never include raw payload content here.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    PreconditionViolated(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many messages")]
    RateLimited,

    #[error("Message too large")]
    Oversize,

    #[error("Could not allocate an invite code, try again")]
    AllocationExhausted,

    #[error("Service temporarily unavailable")]
    BackendUnavailable,
}

impl From<BackendError> for DispatchError {
    fn from(_: BackendError) -> Self {
        // Intentionally drop the backend's internal detail: §7 requires a
        // generic message here so store internals never leak to a client.
        DispatchError::BackendUnavailable
    }
}

impl From<InviteError> for DispatchError {
    fn from(value: InviteError) -> Self {
        match value {
            InviteError::AllocationExhausted => DispatchError::AllocationExhausted,
            InviteError::Backend(e) => e.into(),
        }
    }
}

pub type BResult<T> = Result<T, BackendError>;
pub type DResult<T> = Result<T, DispatchError>;
