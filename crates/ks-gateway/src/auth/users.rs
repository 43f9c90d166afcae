//! Config-backed identity provider

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use ks_core::config::UserEntry;
use ks_core::error::ConfigError;
use ks_core::traits::IdentityProvider;
use ks_core::{GatewayError, UserIdentity};

/// Hex encoded SHA-256 of a password, as stored in the users table
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Users and password hashes loaded from configuration
pub struct StaticUsers {
    users: HashMap<String, [u8; 32]>,
}

impl StaticUsers {
    /// Build the table from config entries
    pub fn from_entries(entries: &[UserEntry]) -> Result<Self, ConfigError> {
        let mut users = HashMap::with_capacity(entries.len());

        for entry in entries {
            let digest = hex::decode(entry.password_sha256.trim()).map_err(|e| {
                ConfigError::Invalid(format!(
                    "password_sha256 for user {:?} is not hex: {}",
                    entry.username, e
                ))
            })?;
            let digest: [u8; 32] = digest.try_into().map_err(|_| {
                ConfigError::Invalid(format!(
                    "password_sha256 for user {:?} must be 32 bytes",
                    entry.username
                ))
            })?;

            if users.insert(entry.username.clone(), digest).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate user {:?}",
                    entry.username
                )));
            }
        }

        Ok(Self { users })
    }

    /// Number of known users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if there are no users
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticUsers {
    async fn verify(&self, username: &str, password: &str) -> Result<UserIdentity, GatewayError> {
        let Some(expected) = self.users.get(username) else {
            tracing::debug!("Login attempt for unknown user {:?}", username);
            return Err(GatewayError::Unauthorized);
        };

        let actual = Sha256::digest(password.as_bytes());
        if !constant_time_eq(expected, actual.as_slice()) {
            tracing::debug!("Wrong password for user {:?}", username);
            return Err(GatewayError::Unauthorized);
        }

        Ok(UserIdentity::new(username))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
