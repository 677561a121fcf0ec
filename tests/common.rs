use reportdesk_server::api::{AppState, app_router};
use reportdesk_server::config::{
    AuthConfig, Config, LogFormat, RateLimitConfig, ServerConfig, TelemetryConfig,
};
use reportdesk_server::domain::auth::Password;
use reportdesk_server::domain::user::Role;
use reportdesk_server::services::auth_service::AuthService;
use reportdesk_server::services::mailer::{LogMailer, Mailer};
use reportdesk_server::services::rate_limit_service::{FixedWindowLimiter, RateLimitService};
use reportdesk_server::storage::memory::{MemoryRefreshTokenStore, MemoryUserStore};
use reportdesk_server::storage::{RefreshTokenStore, UserStore};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("reportdesk_server=debug".parse().unwrap())
            .add_directive("tower=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused-in-tests".to_string(),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            trusted_proxies: vec![],
            shutdown_timeout_secs: 1,
        },
        auth: AuthConfig {
            access_token_secret: "test_access_secret".to_string(),
            refresh_token_secret: "test_refresh_secret".to_string(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_days: 7,
            issuer: "reportdesk".to_string(),
            audience: "reportdesk-api".to_string(),
            setup_token_ttl_hours: 24,
            reset_token_ttl_mins: 60,
            login_failure_delay_ms: 25,
            cookie_domain: None,
            cookie_secure: false,
            token_cleanup_interval_secs: 0,
        },
        // Limits high enough to stay out of the way; the rate-limit tests
        // override them.
        rate_limit: RateLimitConfig {
            login_max: 10_000,
            login_window_secs: 900,
            refresh_max: 10_000,
            refresh_window_secs: 60,
            register_max: 10_000,
            register_window_secs: 3600,
            forgot_max: 10_000,
            forgot_window_secs: 3600,
            reset_max: 10_000,
            reset_window_secs: 900,
        },
        telemetry: TelemetryConfig { otlp_endpoint: None, log_format: LogFormat::Text },
    }
}

pub struct TestApp {
    pub server_url: String,
    pub client: reqwest::Client,
    pub users: Arc<MemoryUserStore>,
    pub ledger: Arc<MemoryRefreshTokenStore>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(), Arc::new(LogMailer)).await
    }

    pub async fn spawn_with(config: Config, mailer: Arc<dyn Mailer>) -> Self {
        setup_tracing();

        let users = Arc::new(MemoryUserStore::new());
        let ledger = Arc::new(MemoryRefreshTokenStore::new());

        let auth_service = AuthService::new(
            config.auth.clone(),
            Arc::clone(&users) as Arc<dyn UserStore>,
            Arc::clone(&ledger) as Arc<dyn RefreshTokenStore>,
            mailer,
        );
        let rate_limit_service = RateLimitService::new(Arc::new(FixedWindowLimiter::new()));

        let state = AppState { config, auth_service, rate_limit_service };
        let app = app_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let client = reqwest::Client::builder().cookie_store(true).build().unwrap();
        Self { server_url: format!("http://{addr}"), client, users, ledger }
    }

    /// Seeds an admin directly in the store and logs in over HTTP,
    /// returning a usable access token.
    pub async fn admin_token(&self) -> String {
        let email = "admin@reportdesk.test";
        if self.users.find_by_email(email).await.unwrap().is_none() {
            self.users.insert_user(
                email,
                "Admin",
                Some(Password::hash("AdminPassw0rd").unwrap()),
                Role::Admin,
                true,
            );
        }

        let resp = self
            .client
            .post(format!("{}/auth/login", self.server_url))
            .json(&json!({ "email": email, "password": "AdminPassw0rd" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK, "admin login should succeed");

        let body: serde_json::Value = resp.json().await.unwrap();
        body["accessToken"].as_str().unwrap().to_string()
    }

    /// Drives the full onboarding flow over HTTP: register, admin-verify,
    /// consume the setup token. Returns the new user's id.
    pub async fn onboard_user(&self, email: &str, password: &str) -> i64 {
        let resp = self
            .client
            .post(format!("{}/auth/register", self.server_url))
            .json(&json!({ "email": email, "name": "Test User" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        let user_id = body["id"].as_i64().unwrap();

        let admin_token = self.admin_token().await;
        let resp = self
            .client
            .post(format!("{}/auth/users/{}/verify", self.server_url, user_id))
            .bearer_auth(&admin_token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let setup_token = self
            .users
            .find_by_email(email)
            .await
            .unwrap()
            .unwrap()
            .password_setup_token
            .expect("setup token should be issued on verification");

        let resp = self
            .client
            .post(format!("{}/auth/setup-password", self.server_url))
            .json(&json!({ "token": setup_token, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        user_id
    }

    pub async fn login(&self, email: &str, password: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/auth/login", self.server_url))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .unwrap()
    }
}

/// Pulls a named cookie's value out of a response's Set-Cookie headers.
pub fn extract_cookie(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|raw| {
            let (pair, _) = raw.split_once(';').unwrap_or((raw, ""));
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name && !value.is_empty()).then(|| value.to_string())
        })
}
