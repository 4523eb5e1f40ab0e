use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    error::AuthError,
    jwt::TokenIssuer,
    password::{PasswordHasher, DUMMY_HASH},
    repo::CredentialStore,
    repo_types::{NewUser, Profile, User, UserPatch},
    reset::ResetTokenManager,
};
use crate::{clock::Clock, config::AppConfig, mail::EmailSender};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Bearer token handed out on login.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub ttl: Duration,
    pub user_id: i64,
}

/// Registration, login, bearer resolution and password recovery over a
/// [`CredentialStore`]. Holds no per-request state.
#[derive(Clone)]
pub struct AuthGateway {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
    tokens: TokenIssuer,
    resets: ResetTokenManager,
    mailer: Arc<dyn EmailSender>,
}

impl AuthGateway {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: PasswordHasher,
        tokens: TokenIssuer,
        resets: ResetTokenManager,
        mailer: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            store,
            hasher,
            tokens,
            resets,
            mailer,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn CredentialStore>,
        mailer: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hasher = PasswordHasher::new(config.hash_concurrency);
        let tokens = TokenIssuer::new(&config.jwt, clock.clone());
        let resets = ResetTokenManager::new(
            store.clone(),
            hasher.clone(),
            clock,
            Duration::minutes(config.reset_ttl_minutes),
        );
        Self::new(store, hasher, tokens, resets, mailer)
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        profile: Profile,
    ) -> Result<User, AuthError> {
        let email = email.trim();
        if !is_valid_email(email) {
            warn!(email, "registration with invalid email");
            return Err(AuthError::Validation("Invalid email format".into()));
        }

        if self.store.find_by_email(email).await?.is_some() {
            warn!(email, "email already registered");
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash = self.hasher.hash(password).await?;
        // The unique index still decides a race between two registrations.
        let user = self
            .store
            .insert(NewUser {
                email: email.to_owned(),
                password_hash,
                is_active: true,
                is_verified: true,
                birthdate: profile.birthdate,
                is_salaried: profile.is_salaried,
                address: profile.address,
            })
            .await?;

        info!(user_id = user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Unknown email, wrong password and inactive account are indistinguishable.
    pub async fn login(&self, email: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let email = email.trim();
        let found = self.store.find_by_email(email).await?;
        // Unknown emails still pay for one argon2 verification.
        let hash = found
            .as_ref()
            .map_or(DUMMY_HASH, |user| user.password_hash.as_str());
        let matches = self.hasher.verify(password, hash).await?;

        let Some(user) = found else {
            warn!(email, "login unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !matches {
            warn!(user_id = user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            warn!(user_id = user.id, "login on inactive account");
            return Err(AuthError::InvalidCredentials);
        }

        let ttl = self.tokens.default_ttl();
        let token = self.tokens.issue(&user.email, ttl)?;
        info!(user_id = user.id, "user logged in");
        Ok(IssuedToken {
            token,
            ttl,
            user_id: user.id,
        })
    }

    pub async fn resolve(&self, bearer: &str) -> Result<User, AuthError> {
        let claims = self.tokens.validate(bearer).map_err(|e| {
            debug!(error = %e, "bearer token rejected");
            AuthError::Unauthenticated
        })?;

        let Some(user) = self.store.find_by_email(&claims.sub).await? else {
            debug!(subject = %claims.sub, "bearer subject no longer exists");
            return Err(AuthError::Unauthenticated);
        };
        if !user.is_active {
            debug!(user_id = user.id, "bearer subject inactive");
            return Err(AuthError::Unauthenticated);
        }
        Ok(user)
    }

    /// Succeeds whether or not the email is registered.
    pub async fn request_reset(&self, email: &str) -> Result<(), AuthError> {
        let email = email.trim();
        if let Some(token) = self.resets.create_reset_token(email).await? {
            if !self.mailer.send_password_reset(email, &token).await {
                error!(email, "failed to send password reset email");
            }
        }
        Ok(())
    }

    pub async fn perform_reset(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        if self.resets.consume(token, new_password).await? {
            Ok(())
        } else {
            Err(AuthError::InvalidOrExpiredToken)
        }
    }

    pub async fn get_user(&self, id: i64) -> Result<User, AuthError> {
        self.store.find_by_id(id).await?.ok_or(AuthError::NotFound)
    }

    pub async fn list_users(&self, offset: i64, limit: i64) -> Result<Vec<User>, AuthError> {
        Ok(self.store.list(offset.max(0), limit.clamp(0, 100)).await?)
    }

    pub async fn update_user(&self, id: i64, mut patch: UserPatch) -> Result<User, AuthError> {
        if let Some(email) = patch.email.as_mut() {
            *email = email.trim().to_owned();
            if !is_valid_email(email) {
                return Err(AuthError::Validation("Invalid email format".into()));
            }
        }

        if patch.is_empty() {
            return self.get_user(id).await;
        }
        let password_hash = match &patch.password {
            Some(password) => Some(self.hasher.hash(password).await?),
            None => None,
        };

        let user = self
            .store
            .update(id, &patch, password_hash.as_deref())
            .await?;
        info!(user_id = user.id, "user updated");
        Ok(user)
    }

    pub async fn delete_user(&self, id: i64) -> Result<(), AuthError> {
        if self.store.delete(id).await? {
            info!(user_id = id, "user deleted");
            Ok(())
        } else {
            warn!(user_id = id, "delete of unknown user");
            Err(AuthError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use time::OffsetDateTime;

    use super::*;
    use crate::{
        auth::{
            jwt::TokenError, memory::MemoryCredentialStore, password::hash_password,
            repo::StoreError,
        },
        clock::ManualClock,
        config::JwtConfig,
    };

    /// Remembers the last reset token instead of mailing it.
    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Outbox {
        fn last_token(&self) -> Option<String> {
            self.sent.lock().unwrap().last().map(|(_, t)| t.clone())
        }
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EmailSender for Outbox {
        async fn send_password_reset(&self, email: &str, token: &str) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_owned(), token.to_owned()));
            true
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl EmailSender for FailingMailer {
        async fn send_password_reset(&self, _email: &str, _token: &str) -> bool {
            false
        }
    }

    /// Completes a pending password reset right before the next lookup by id
    /// or profile write reaches the inner store.
    struct ResetRacingStore {
        inner: MemoryCredentialStore,
        pending: Mutex<Option<(String, String)>>,
    }

    impl ResetRacingStore {
        async fn reset_first(&self) {
            let pending = self.pending.lock().unwrap().take();
            if let Some((token, hash)) = pending {
                self.inner
                    .consume_reset_token(&token, &hash, OffsetDateTime::now_utc())
                    .await
                    .unwrap()
                    .expect("pending reset applies");
            }
        }
    }

    #[async_trait]
    impl CredentialStore for ResetRacingStore {
        async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
            let user = self.inner.find_by_id(id).await;
            self.reset_first().await;
            user
        }
        async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>, StoreError> {
            self.inner.list(offset, limit).await
        }
        async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
            self.inner.insert(user).await
        }
        async fn update(
            &self,
            id: i64,
            patch: &UserPatch,
            password_hash: Option<&str>,
        ) -> Result<User, StoreError> {
            self.reset_first().await;
            self.inner.update(id, patch, password_hash).await
        }
        async fn delete(&self, id: i64) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
        async fn set_reset_token(
            &self,
            email: &str,
            token: &str,
            expires: OffsetDateTime,
        ) -> Result<Option<User>, StoreError> {
            self.inner.set_reset_token(email, token, expires).await
        }
        async fn find_by_reset_token(
            &self,
            token: &str,
            now: OffsetDateTime,
        ) -> Result<Option<User>, StoreError> {
            self.inner.find_by_reset_token(token, now).await
        }
        async fn consume_reset_token(
            &self,
            token: &str,
            password_hash: &str,
            now: OffsetDateTime,
        ) -> Result<Option<User>, StoreError> {
            self.inner
                .consume_reset_token(token, password_hash, now)
                .await
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            database_url: "postgres://unused".into(),
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 30,
            },
            reset_ttl_minutes: 60,
            frontend_url: "http://localhost:3000".into(),
            hash_concurrency: 2,
        }
    }

    fn gateway_with(
        mailer: Arc<dyn EmailSender>,
    ) -> (AuthGateway, Arc<MemoryCredentialStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let gateway = AuthGateway::from_config(&config(), store.clone(), mailer, clock.clone());
        (gateway, store, clock)
    }

    #[tokio::test]
    async fn register_twice_is_duplicate() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        assert!(user.is_active);
        assert!(user.is_verified);
        assert_ne!(user.password_hash, "pw1");

        let err = gw
            .register("u@x.com", "other", Profile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail));
    }

    #[tokio::test]
    async fn register_rejects_bad_email() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let err = gw
            .register("not-an-email", "pw1", Profile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn login_failures_look_the_same() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        gw.register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();

        let wrong = gw.login("u@x.com", "nope").await.unwrap_err();
        let unknown = gw.login("ghost@x.com", "pw1").await.unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn login_token_resolves_to_user() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        let issued = gw.login("u@x.com", "pw1").await.unwrap();
        assert_eq!(issued.ttl, Duration::minutes(30));

        let resolved = gw.resolve(&issued.token).await.unwrap();
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn resolve_rejects_expired_garbage_and_missing_subject() {
        let (gw, store, clock) = gateway_with(Arc::new(Outbox::default()));
        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        let issued = gw.login("u@x.com", "pw1").await.unwrap();

        assert!(matches!(
            gw.resolve("garbage").await,
            Err(AuthError::Unauthenticated)
        ));

        clock.advance(Duration::minutes(30));
        assert_eq!(
            gw.tokens().validate(&issued.token).unwrap_err(),
            TokenError::Expired
        );
        assert!(matches!(
            gw.resolve(&issued.token).await,
            Err(AuthError::Unauthenticated)
        ));

        let fresh = gw.tokens().issue_default("u@x.com").unwrap();
        store.delete(user.id).await.unwrap();
        assert!(matches!(
            gw.resolve(&fresh).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn inactive_accounts_cannot_login_or_resolve() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        let issued = gw.login("u@x.com", "pw1").await.unwrap();

        gw.update_user(
            user.id,
            UserPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            gw.resolve(&issued.token).await,
            Err(AuthError::Unauthenticated)
        ));
        assert!(matches!(
            gw.login("u@x.com", "pw1").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn request_reset_is_silent_for_unknown_email() {
        let outbox = Arc::new(Outbox::default());
        let (gw, _, _) = gateway_with(outbox.clone());
        gw.request_reset("ghost@x.com").await.unwrap();
        assert_eq!(outbox.count(), 0);
    }

    #[tokio::test]
    async fn mail_failure_does_not_surface() {
        let (gw, store, _) = gateway_with(Arc::new(FailingMailer));
        gw.register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        gw.request_reset("u@x.com").await.unwrap();
        let user = store.find_by_email("u@x.com").await.unwrap().unwrap();
        assert!(user.has_pending_reset());
    }

    #[tokio::test]
    async fn perform_reset_twice_fails_second_time() {
        let outbox = Arc::new(Outbox::default());
        let (gw, _, _) = gateway_with(outbox.clone());
        gw.register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        gw.request_reset("u@x.com").await.unwrap();
        let token = outbox.last_token().expect("reset mail sent");

        gw.perform_reset(&token, "newpass").await.unwrap();
        let err = gw.perform_reset(&token, "anotherpass").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidOrExpiredToken));
        assert!(gw.login("u@x.com", "newpass").await.is_ok());
    }

    #[tokio::test]
    async fn reset_token_expires_after_an_hour() {
        let outbox = Arc::new(Outbox::default());
        let (gw, _, clock) = gateway_with(outbox.clone());
        gw.register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        gw.request_reset("u@x.com").await.unwrap();
        let token = outbox.last_token().unwrap();

        clock.advance(Duration::hours(1));
        assert!(matches!(
            gw.perform_reset(&token, "pw2").await,
            Err(AuthError::InvalidOrExpiredToken)
        ));
        assert!(gw.login("u@x.com", "pw1").await.is_ok());
    }

    #[tokio::test]
    async fn end_to_end_credential_lifecycle() {
        let outbox = Arc::new(Outbox::default());
        let (gw, _, _) = gateway_with(outbox.clone());

        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        let issued = gw.login("u@x.com", "pw1").await.unwrap();
        assert_eq!(gw.resolve(&issued.token).await.unwrap().id, user.id);

        gw.request_reset("u@x.com").await.unwrap();
        let token = outbox.last_token().unwrap();
        gw.perform_reset(&token, "pw2").await.unwrap();

        assert!(matches!(
            gw.login("u@x.com", "pw1").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(gw.login("u@x.com", "pw2").await.is_ok());
    }

    #[tokio::test]
    async fn update_user_applies_patch_and_rehashes() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let a = gw
            .register(
                "a@x.com",
                "pw1",
                Profile {
                    address: Some("Clay court".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        gw.register("b@x.com", "pw1", Profile::default())
            .await
            .unwrap();

        let updated = gw
            .update_user(
                a.id,
                UserPatch {
                    password: Some("pw9".into()),
                    is_salaried: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.is_salaried);
        assert_eq!(updated.address.as_deref(), Some("Clay court"));
        assert!(gw.login("a@x.com", "pw9").await.is_ok());

        let err = gw
            .update_user(
                a.id,
                UserPatch {
                    email: Some("b@x.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail));

        assert!(matches!(
            gw.update_user(999, UserPatch::default()).await,
            Err(AuthError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_and_list_users() {
        let (gw, _, _) = gateway_with(Arc::new(Outbox::default()));
        let a = gw
            .register("a@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        gw.register("b@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        assert_eq!(gw.list_users(0, 10).await.unwrap().len(), 2);

        gw.delete_user(a.id).await.unwrap();
        assert!(matches!(gw.delete_user(a.id).await, Err(AuthError::NotFound)));
        assert!(matches!(gw.get_user(a.id).await, Err(AuthError::NotFound)));
        assert_eq!(gw.list_users(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn profile_update_keeps_concurrent_password_reset() {
        let outbox = Arc::new(Outbox::default());
        let store = Arc::new(ResetRacingStore {
            inner: MemoryCredentialStore::new(),
            pending: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::starting_now());
        let gw = AuthGateway::from_config(&config(), store.clone(), outbox.clone(), clock);

        let user = gw
            .register("u@x.com", "pw1", Profile::default())
            .await
            .unwrap();
        gw.request_reset("u@x.com").await.unwrap();
        let token = outbox.last_token().unwrap();
        *store.pending.lock().unwrap() = Some((token, hash_password("pw2").unwrap()));

        let updated = gw
            .update_user(
                user.id,
                UserPatch {
                    address: Some(Some("Court 1".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.address.as_deref(), Some("Court 1"));
        assert!(!updated.has_pending_reset());

        assert!(gw.login("u@x.com", "pw2").await.is_ok());
        assert!(matches!(
            gw.login("u@x.com", "pw1").await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
