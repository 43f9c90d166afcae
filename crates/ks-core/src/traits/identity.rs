//! Identity capability

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::UserIdentity;

/// Verifies credentials and hands out [`UserIdentity`] values
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check a username/password pair.
    ///
    /// Fails with [`GatewayError::Unauthorized`] for unknown users and wrong
    /// passwords alike.
    async fn verify(&self, username: &str, password: &str) -> Result<UserIdentity, GatewayError>;
}
