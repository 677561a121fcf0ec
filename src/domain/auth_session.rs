/// Result of a session-establishing operation (login or refresh). The
/// access token goes out in the response body, the refresh token in the
/// HttpOnly cookie.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub refresh_max_age_secs: i64,
}
