use async_trait::async_trait;
use tracing::{debug, info, trace};

/// Outbound mail used by the reset flow.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// `false` if the message could not be handed off.
    async fn send_password_reset(&self, email: &str, token: &str) -> bool;
}

/// Records reset links through tracing instead of speaking SMTP.
#[derive(Debug, Clone)]
pub struct LogMailer {
    frontend_url: String,
}

impl LogMailer {
    pub fn new(frontend_url: impl Into<String>) -> Self {
        Self {
            frontend_url: frontend_url.into(),
        }
    }

    pub fn reset_link(&self, token: &str) -> String {
        format!(
            "{}/reset-password/{}",
            self.frontend_url.trim_end_matches('/'),
            token
        )
    }
}

/// Keeps a short prefix of a reset token, enough to correlate log lines.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}****")
}

#[async_trait]
impl EmailSender for LogMailer {
    async fn send_password_reset(&self, email: &str, token: &str) -> bool {
        info!(email, "password reset mail queued");
        debug!(email, link = %self.reset_link(&mask_token(token)), "password reset link");
        // The live token only appears at trace.
        trace!(email, link = %self.reset_link(token), "password reset link");
        true
    }
}
