//! Bearer credential supply for the remote player.

use std::sync::atomic::{AtomicBool, Ordering};

use log::error;

/// Reasons a supplier cannot hand out a token right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("access token expired")]
    Expired,
    #[error("no credentials available")]
    Missing,
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Source of bearer tokens, renewed out-of-band by the implementation.
pub trait CredentialSupplier: Send + Sync {
    fn access_token(&self) -> Result<String, CredentialError>;

    /// Called when the remote rejected the current token. Implementations may
    /// schedule an early refresh; callers never retry on their own.
    fn report_unauthorized(&self) {}
}

/// Supplier for a fixed token, such as one passed through the environment.
///
/// The token cannot be renewed in-process. A rejection is logged once and the
/// token is kept, so each later request surfaces `Unauthorized` on its own.
pub struct StaticCredentialSupplier {
    token: String,
    rejected: AtomicBool,
}

impl StaticCredentialSupplier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            rejected: AtomicBool::new(false),
        }
    }
}

impl CredentialSupplier for StaticCredentialSupplier {
    fn access_token(&self) -> Result<String, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(self.token.clone())
    }

    fn report_unauthorized(&self) {
        if !self.rejected.swap(true, Ordering::SeqCst) {
            error!(
                "StaticCredentialSupplier: access token was rejected; restart with a fresh token"
            );
        }
    }
}
