use clap::{Args, Parser, ValueEnum};
use ipnetwork::IpNetwork;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Database connection URL
    #[arg(long, env = "REPORTDESK_DATABASE_URL")]
    pub database_url: String,

    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub auth: AuthConfig,

    #[command(flatten)]
    pub rate_limit: RateLimitConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Args)]
pub struct ServerConfig {
    /// Host to listen on
    #[arg(long, env = "REPORTDESK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "REPORTDESK_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Comma-separated list of CIDRs to trust for X-Forwarded-For IP extraction
    #[arg(
        long,
        env = "REPORTDESK_TRUSTED_PROXIES",
        default_value = "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,127.0.0.1/32",
        value_delimiter = ','
    )]
    pub trusted_proxies: Vec<IpNetwork>,

    /// Timeout for graceful shutdown of background tasks
    #[arg(long, env = "REPORTDESK_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct AuthConfig {
    /// Secret key for signing access tokens
    #[arg(long, env = "REPORTDESK_ACCESS_TOKEN_SECRET")]
    pub access_token_secret: String,

    /// Secret key for signing refresh tokens (independent of the access secret)
    #[arg(long, env = "REPORTDESK_REFRESH_TOKEN_SECRET")]
    pub refresh_token_secret: String,

    /// Access token time-to-live in seconds
    #[arg(long, env = "REPORTDESK_ACCESS_TOKEN_TTL_SECS", default_value_t = 900)]
    pub access_token_ttl_secs: u64,

    /// Refresh token time-to-live in days
    #[arg(long, env = "REPORTDESK_REFRESH_TOKEN_TTL_DAYS", default_value_t = 7)]
    pub refresh_token_ttl_days: i64,

    /// JWT issuer claim, checked on verification
    #[arg(long, env = "REPORTDESK_TOKEN_ISSUER", default_value = "reportdesk")]
    pub issuer: String,

    /// JWT audience claim, checked on verification
    #[arg(long, env = "REPORTDESK_TOKEN_AUDIENCE", default_value = "reportdesk-api")]
    pub audience: String,

    /// Password setup token time-to-live in hours (admin-initiated)
    #[arg(long, env = "REPORTDESK_SETUP_TOKEN_TTL_HOURS", default_value_t = 24)]
    pub setup_token_ttl_hours: i64,

    /// Password reset token time-to-live in minutes (self-initiated)
    #[arg(long, env = "REPORTDESK_RESET_TOKEN_TTL_MINS", default_value_t = 60)]
    pub reset_token_ttl_mins: i64,

    /// Fixed delay applied to every failed login branch, masking
    /// user-enumeration timing differences
    #[arg(long, env = "REPORTDESK_LOGIN_FAILURE_DELAY_MS", default_value_t = 250)]
    pub login_failure_delay_ms: u64,

    /// Domain attribute for the refresh cookie
    #[arg(long, env = "REPORTDESK_COOKIE_DOMAIN")]
    pub cookie_domain: Option<String>,

    /// Mark the refresh cookie Secure and SameSite=Strict (production)
    #[arg(long, env = "REPORTDESK_COOKIE_SECURE", default_value_t = false)]
    pub cookie_secure: bool,

    /// How often to sweep expired refresh token records (0 disables the sweep)
    #[arg(long, env = "REPORTDESK_TOKEN_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub token_cleanup_interval_secs: u64,
}

/// Fixed-window limits. Counters are process-local and approximate: a burst
/// straddling a window boundary can admit up to twice the configured maximum,
/// and multiple server instances do not share counters.
#[derive(Clone, Debug, Args)]
pub struct RateLimitConfig {
    /// Login attempts allowed per (ip, email) per window
    #[arg(long, env = "REPORTDESK_LOGIN_MAX_ATTEMPTS", default_value_t = 5)]
    pub login_max: u32,

    /// Login window in seconds
    #[arg(long, env = "REPORTDESK_LOGIN_WINDOW_SECS", default_value_t = 900)]
    pub login_window_secs: u64,

    /// Refresh calls allowed per ip per window
    #[arg(long, env = "REPORTDESK_REFRESH_MAX_ATTEMPTS", default_value_t = 10)]
    pub refresh_max: u32,

    /// Refresh window in seconds
    #[arg(long, env = "REPORTDESK_REFRESH_WINDOW_SECS", default_value_t = 60)]
    pub refresh_window_secs: u64,

    /// Registrations allowed per ip per window
    #[arg(long, env = "REPORTDESK_REGISTER_MAX_ATTEMPTS", default_value_t = 3)]
    pub register_max: u32,

    /// Registration window in seconds
    #[arg(long, env = "REPORTDESK_REGISTER_WINDOW_SECS", default_value_t = 3600)]
    pub register_window_secs: u64,

    /// Forgot-password requests allowed per (ip, email) per window
    #[arg(long, env = "REPORTDESK_FORGOT_MAX_ATTEMPTS", default_value_t = 3)]
    pub forgot_max: u32,

    /// Forgot-password window in seconds
    #[arg(long, env = "REPORTDESK_FORGOT_WINDOW_SECS", default_value_t = 3600)]
    pub forgot_window_secs: u64,

    /// Reset-password attempts allowed per ip per window
    #[arg(long, env = "REPORTDESK_RESET_MAX_ATTEMPTS", default_value_t = 5)]
    pub reset_max: u32,

    /// Reset-password window in seconds
    #[arg(long, env = "REPORTDESK_RESET_WINDOW_SECS", default_value_t = 900)]
    pub reset_window_secs: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// OTLP endpoint for traces and metrics (disabled when unset)
    #[arg(long, env = "REPORTDESK_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Log output format
    #[arg(long, env = "REPORTDESK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }
}
