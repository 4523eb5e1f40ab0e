use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use time::Duration;
use tracing::{info, warn};

use super::{
    password::PasswordHasher,
    repo::{CredentialStore, StoreError},
    repo_types::User,
};
use crate::clock::Clock;

const TOKEN_BYTES: usize = 32;

/// URL-safe, unpadded encoding of 32 bytes from the OS RNG.
pub fn generate_reset_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Issues and redeems single-use password reset tokens stored on the user row.
#[derive(Clone)]
pub struct ResetTokenManager {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ResetTokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: PasswordHasher,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            hasher,
            clock,
            ttl,
        }
    }

    /// `None` when no user has this email. Callers must not reveal which.
    pub async fn create_reset_token(&self, email: &str) -> Result<Option<String>, StoreError> {
        let token = generate_reset_token();
        let expires = self.clock.now() + self.ttl;
        match self.store.set_reset_token(email, &token, expires).await? {
            Some(user) => {
                info!(user_id = user.id, "password reset token created");
                Ok(Some(token))
            }
            None => {
                warn!(email, "password reset requested for unknown email");
                Ok(None)
            }
        }
    }

    pub async fn verify_reset_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        self.store.find_by_reset_token(token, self.clock.now()).await
    }

    /// Sets a new password and clears the token. `false` leaves everything as it was.
    pub async fn consume(&self, token: &str, new_password: &str) -> anyhow::Result<bool> {
        if self.verify_reset_token(token).await?.is_none() {
            warn!("invalid or expired password reset token");
            return Ok(false);
        }

        let hash = self.hasher.hash(new_password).await?;
        // A concurrent consumer may have won since the check above.
        match self
            .store
            .consume_reset_token(token, &hash, self.clock.now())
            .await?
        {
            Some(user) => {
                info!(user_id = user.id, "password reset completed");
                Ok(true)
            }
            None => {
                warn!("password reset token consumed concurrently");
                Ok(false)
            }
        }
    }
}
