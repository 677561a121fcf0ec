#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use reportdesk_server::api::{AppState, app_router};
use reportdesk_server::config::Config;
use reportdesk_server::services::auth_service::AuthService;
use reportdesk_server::services::mailer::LogMailer;
use reportdesk_server::services::rate_limit_service::{FixedWindowLimiter, RateLimitService};
use reportdesk_server::storage::refresh_token_repo::PgRefreshTokenStore;
use reportdesk_server::storage::user_repo::PgUserStore;
use reportdesk_server::storage::{self, RefreshTokenStore, UserStore};
use reportdesk_server::workers::refresh_token_cleanup::RefreshTokenCleanupWorker;
use reportdesk_server::telemetry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    telemetry::init_telemetry(&config.telemetry)?;

    let pool = storage::init_pool(&config.database_url).await?;
    sqlx::migrate!().run(&pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let users: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pool.clone()));
    let ledger: Arc<dyn RefreshTokenStore> = Arc::new(PgRefreshTokenStore::new(pool));

    let auth_service =
        AuthService::new(config.auth.clone(), users, Arc::clone(&ledger), Arc::new(LogMailer));
    let rate_limit_service = RateLimitService::new(Arc::new(FixedWindowLimiter::new()));

    let cleanup = RefreshTokenCleanupWorker::new(
        Arc::clone(&ledger),
        config.auth.token_cleanup_interval_secs,
    );
    let cleanup_task = tokio::spawn(cleanup.run(shutdown_rx.clone()));

    let state = AppState { config: config.clone(), auth_service, rate_limit_service };
    let app = app_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "listening");

    let mut serve_rx = shutdown_rx.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = serve_rx.wait_for(|&s| s).await;
        })
        .await?;

    tokio::select! {
        _ = cleanup_task => {
            tracing::info!("Background tasks finished.");
        }
        () = tokio::time::sleep(std::time::Duration::from_secs(config.server.shutdown_timeout_secs)) => {
            tracing::warn!("Timeout waiting for background tasks to finish.");
        }
    }

    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }

        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
