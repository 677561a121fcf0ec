use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Recipient rejected")]
    Rejected,
    #[error("Delivery failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Outbound email seam. Delivery is best-effort everywhere it is used:
/// a failed send never rolls back the state change that triggered it.
#[async_trait]
pub trait Mailer: Send + Sync + std::fmt::Debug {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError>;
}

/// Default adapter: logs the message instead of delivering it. Useful for
/// development and as the fallback when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        tracing::info!(to, subject, body_len = html.len(), "Email send (log-only adapter)");
        Ok(())
    }
}
