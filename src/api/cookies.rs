use crate::config::AuthConfig;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

/// Cookie carrying the short-lived access token, for cookie-based clients.
pub const ACCESS_COOKIE: &str = "reportdesk_access";
/// Cookie carrying the rotated refresh token.
pub const REFRESH_COOKIE: &str = "reportdesk_refresh";

fn base(config: &AuthConfig, name: &str, value: String, max_age: Duration) -> Cookie<'static> {
    // Strict only in production: cross-site navigation in dev setups breaks
    // under Strict, so non-secure deployments fall back to Lax.
    let same_site = if config.cookie_secure { SameSite::Strict } else { SameSite::Lax };

    let mut builder = Cookie::build((name.to_string(), value))
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(same_site)
        .path("/".to_string())
        .max_age(max_age);

    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }

    builder.build()
}

pub fn access_cookie(config: &AuthConfig, token: &str, max_age_secs: i64) -> Cookie<'static> {
    base(config, ACCESS_COOKIE, token.to_string(), Duration::seconds(max_age_secs))
}

pub fn refresh_cookie(config: &AuthConfig, token: &str, max_age_secs: i64) -> Cookie<'static> {
    base(config, REFRESH_COOKIE, token.to_string(), Duration::seconds(max_age_secs))
}

pub fn clear_access_cookie(config: &AuthConfig) -> Cookie<'static> {
    base(config, ACCESS_COOKIE, String::new(), Duration::ZERO)
}

pub fn clear_refresh_cookie(config: &AuthConfig) -> Cookie<'static> {
    base(config, REFRESH_COOKIE, String::new(), Duration::ZERO)
}
