use std::fmt;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

// Keeps the signing secret out of logs.
impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl_minutes", &self.ttl_minutes)
            .finish()
    }
}

impl JwtConfig {
    /// Random one-shot secret, used when none is configured. Tokens signed
    /// with it do not survive a restart.
    pub fn ephemeral_secret() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Base64UrlUnpadded::encode_string(&bytes)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub reset_ttl_minutes: i64,
    pub frontend_url: String,
    pub hash_concurrency: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;

        let secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.trim().is_empty() => s,
            _ => {
                tracing::warn!("JWT_SECRET not set; using an ephemeral signing key");
                JwtConfig::ephemeral_secret()
            }
        };
        let jwt = JwtConfig {
            secret,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "academy".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "academy-users".into()),
            ttl_minutes: env_parse("ACCESS_TOKEN_EXPIRE_MINUTES").unwrap_or(30),
        };

        let default_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Ok(Self {
            database_url,
            jwt,
            reset_ttl_minutes: env_parse("RESET_TOKEN_EXPIRE_MINUTES").unwrap_or(60),
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            hash_concurrency: env_parse("HASH_CONCURRENCY")
                .filter(|n: &usize| {
                    if *n == 0 {
                        tracing::warn!("HASH_CONCURRENCY must be positive; using default");
                    }
                    *n > 0
                })
                .unwrap_or(default_concurrency),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    parse_setting(key, std::env::var(key).ok())
}

// A value that is set but does not parse is reported, then treated as unset.
fn parse_setting<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable setting; using default");
            None
        }
    }
}
