use crate::error::AppError;
use crate::storage::RefreshTokenStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Periodic sweep of naturally-expired ledger records. Expiry is also
/// handled lazily on lookup; the sweep just keeps the table from growing
/// with sessions that were simply abandoned.
#[derive(Debug)]
pub struct RefreshTokenCleanupWorker {
    ledger: Arc<dyn RefreshTokenStore>,
    cleanup_interval_secs: u64,
}

impl RefreshTokenCleanupWorker {
    #[must_use]
    pub fn new(ledger: Arc<dyn RefreshTokenStore>, cleanup_interval_secs: u64) -> Self {
        Self { ledger, cleanup_interval_secs }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.cleanup_interval_secs == 0 {
            tracing::info!("Refresh token cleanup is disabled (interval = 0)");
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(self.cleanup_interval_secs));

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.perform_cleanup()
                        .instrument(tracing::info_span!("run_refresh_token_cleanup"))
                        .await
                    {
                        tracing::error!(error = ?e, "Refresh token cleanup iteration failed");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Refresh token cleanup loop shutting down...");
    }

    /// # Errors
    /// Returns an error if the store call fails.
    #[tracing::instrument(skip(self), err, fields(expired_deleted = tracing::field::Empty))]
    pub async fn perform_cleanup(&self) -> Result<(), AppError> {
        tracing::debug!("Running refresh token cleanup...");

        let count = self.ledger.delete_expired().await?;
        if count > 0 {
            tracing::info!(count = %count, "Deleted expired refresh tokens");
            tracing::Span::current().record("expired_deleted", count);
        }

        Ok(())
    }
}
