use std::collections::BTreeMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::repo::{CredentialStore, StoreError};
use super::repo_types::{NewUser, User, UserPatch};

#[derive(Default)]
struct Inner {
    next_id: i64,
    users: BTreeMap<i64, User>,
}

impl Inner {
    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id) != except)
    }
}

fn holds_pending_reset(user: &User, token: &str, now: OffsetDateTime) -> bool {
    user.password_reset_token.as_deref() == Some(token)
        && user.password_reset_token_expires.is_some_and(|exp| exp > now)
}

/// Process-local [`CredentialStore`]. Each method holds the lock for its
/// whole read-modify-write, matching the row atomicity of the SQL store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Inner>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.email_taken(&user.email, None) {
            return Err(StoreError::DuplicateEmail);
        }
        inner.next_id += 1;
        let row = User {
            id: inner.next_id,
            email: user.email,
            password_hash: user.password_hash,
            is_active: user.is_active,
            is_verified: user.is_verified,
            birthdate: user.birthdate,
            is_salaried: user.is_salaried,
            address: user.address,
            password_reset_token: None,
            password_reset_token_expires: None,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        id: i64,
        patch: &UserPatch,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(email) = &patch.email {
            if inner.email_taken(email, Some(id)) {
                return Err(StoreError::DuplicateEmail);
            }
        }
        let row = inner.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        patch.apply_to(row);
        if let Some(hash) = password_hash {
            row.password_hash = hash.to_owned();
        }
        Ok(row.clone())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.users.remove(&id).is_some())
    }

    async fn set_reset_token(
        &self,
        email: &str,
        token: &str,
        expires: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(row) = inner.users.values_mut().find(|u| u.email == email) else {
            return Ok(None);
        };
        row.password_reset_token = Some(token.to_owned());
        row.password_reset_token_expires = Some(expires);
        Ok(Some(row.clone()))
    }

    async fn find_by_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| holds_pending_reset(u, token, now))
            .cloned())
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(row) = inner
            .users
            .values_mut()
            .find(|u| holds_pending_reset(u, token, now))
        else {
            return Ok(None);
        };
        row.password_hash = password_hash.to_owned();
        row.password_reset_token = None;
        row.password_reset_token_expires = None;
        Ok(Some(row.clone()))
    }
}
