//! Unified error type for repository operations

use thiserror::Error;

/// Errors surfaced by repository operations.
///
/// Malformed filter input is never an error: bad operators, unparseable
/// dynamic query strings, and fields outside the allow-lists degrade to
/// "clause omitted". Only the by-id operations have hard failure modes,
/// because those name a single unambiguous target.
#[derive(Error, Debug)]
pub enum RepoError {
    /// A by-id operation was called with id 0
    #[error("id cannot be zero")]
    InvalidId,

    /// No row matched a by-id get, update, or delete
    #[error("record not found")]
    NotFound,

    /// A failure surfaced by the underlying pool, passed through unchanged
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl RepoError {
    /// True when retrying at the call site could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::InvalidId | Self::NotFound => false,
        }
    }
}
