use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::auth::repo_types::{NewUser, User, UserPatch};

const EMAIL_UNIQUE: &str = "users_email_key";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("user not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db)
                if db.is_unique_violation() && is_email_constraint(db.constraint()) =>
            {
                StoreError::DuplicateEmail
            }
            sqlx::Error::RowNotFound => StoreError::NotFound,
            _ => StoreError::Database(e),
        }
    }
}

// Other unique indexes (the reset token) must not read as a taken email.
fn is_email_constraint(constraint: Option<&str>) -> bool {
    constraint == Some(EMAIL_UNIQUE)
}

/// Persistence of user identities and their credential state.
///
/// Every method is a single atomic statement against the backing store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>, StoreError>;
    /// Fails with [`StoreError::DuplicateEmail`] if the email is taken.
    async fn insert(&self, user: NewUser) -> Result<User, StoreError>;
    /// Applies `patch` to the row in one statement. Only the fields the patch
    /// carries are written; `password_hash` only when given. Reset-token
    /// fields are left alone; they have their own operations.
    async fn update(
        &self,
        id: i64,
        patch: &UserPatch,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError>;
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Sets the reset-token pair on the user with this email.
    /// `None` if no such user.
    async fn set_reset_token(
        &self,
        email: &str,
        token: &str,
        expires: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;

    /// The user holding `token`, provided it expires after `now`.
    async fn find_by_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;

    /// Replaces the password hash and clears the reset-token pair, only if
    /// `token` is still pending and unexpired at `now`.
    async fn consume_reset_token(
        &self,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;
}

const USER_COLUMNS: &str = "id, email, password_hash, is_active, is_verified, birthdate, \
     is_salaried, address, password_reset_token, password_reset_token_expires, created_at";

#[derive(Clone)]
pub struct PgCredentialStore {
    db: PgPool,
}

impl PgCredentialStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, is_active, is_verified,
                               birthdate, is_salaried, address)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.is_verified)
        .bind(user.birthdate)
        .bind(user.is_salaried)
        .bind(&user.address)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update(
        &self,
        id: i64,
        patch: &UserPatch,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError> {
        // Nullable columns take a presence flag so `Some(None)` can clear them.
        let updated = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET email = COALESCE($2, email),
                   password_hash = COALESCE($3, password_hash),
                   is_active = COALESCE($4, is_active),
                   is_salaried = COALESCE($5, is_salaried),
                   birthdate = CASE WHEN $6 THEN $7::date ELSE birthdate END,
                   address = CASE WHEN $8 THEN $9::text ELSE address END
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.email.as_deref())
        .bind(password_hash)
        .bind(patch.is_active)
        .bind(patch.is_salaried)
        .bind(patch.birthdate.is_some())
        .bind(patch.birthdate.flatten())
        .bind(patch.address.is_some())
        .bind(patch.address.clone().flatten())
        .fetch_optional(&self.db)
        .await?;
        updated.ok_or(StoreError::NotFound)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_reset_token(
        &self,
        email: &str,
        token: &str,
        expires: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET password_reset_token = $2, password_reset_token_expires = $3
             WHERE email = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(token)
        .bind(expires)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
              FROM users
             WHERE password_reset_token = $1
               AND password_reset_token_expires > $2
            "#
        ))
        .bind(token)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET password_hash = $2,
                   password_reset_token = NULL,
                   password_reset_token_expires = NULL
             WHERE password_reset_token = $1
               AND password_reset_token_expires > $3
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(password_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }
}
