use crate::api::AppState;
use crate::api::cookies;
use crate::api::middleware::{AdminUser, AuthUser, ClientMeta, bearer_token, cookie_value};
use crate::api::schemas::auth::{
    ForgotPassword, Login, Logout, MessageResponse, Registration, ResetPassword, SessionResponse,
    SetupPassword, VerifyResponse,
};
use crate::domain::auth_session::AuthSession;
use crate::error::{AppError, Result};
use crate::services::auth_service::canonical_email;
use crate::services::rate_limit_service::Decision;
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use axum_extra::extract::CookieJar;
use std::net::{IpAddr, Ipv4Addr};

pub async fn register(
    State(state): State<AppState>,
    meta: ClientMeta,
    Json(payload): Json<Registration>,
) -> Result<impl IntoResponse> {
    let limits = &state.config.rate_limit;
    enforce(state.rate_limit_service.check_register(client_ip(&meta), limits.register_window_secs, limits.register_max))?;

    let user = state.auth_service.register(&payload.email, &payload.name).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    meta: ClientMeta,
    jar: CookieJar,
    Json(payload): Json<Login>,
) -> Result<impl IntoResponse> {
    let limits = &state.config.rate_limit;
    // Keyed on the same canonical form the service looks up, so padded or
    // case-shifted spellings of one address share a bucket.
    enforce(state.rate_limit_service.check_login(
        client_ip(&meta),
        &canonical_email(&payload.email),
        limits.login_window_secs,
        limits.login_max,
    ))?;

    let (session, _user) =
        state.auth_service.login(&payload.email, &payload.password, meta.ip, meta.user_agent).await?;

    Ok(session_response(&state, jar, session))
}

pub async fn refresh(
    State(state): State<AppState>,
    meta: ClientMeta,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let limits = &state.config.rate_limit;
    enforce(state.rate_limit_service.check_refresh(client_ip(&meta), limits.refresh_window_secs, limits.refresh_max))?;

    let token = cookie_value(&headers, cookies::REFRESH_COOKIE).ok_or(AppError::InvalidToken)?;
    let session = state.auth_service.refresh(&token, meta.ip, meta.user_agent).await?;

    Ok(session_response(&state, jar, session))
}

/// Best-effort: whatever the token's state, the cookies are cleared and the
/// call succeeds. The refresh token is taken from the body, the cookie or a
/// bearer header, in that order.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Option<Json<Logout>>,
) -> Result<impl IntoResponse> {
    let token = payload
        .and_then(|Json(body)| body.refresh_token)
        .or_else(|| cookie_value(&headers, cookies::REFRESH_COOKIE))
        .or_else(|| bearer_token(&headers));

    state.auth_service.logout(token.as_deref()).await;

    let jar = clear_cookies(&state, jar);
    Ok((jar, Json(MessageResponse { message: "Logged out".to_string() })))
}

pub async fn logout_all(
    auth_user: AuthUser,
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    state.auth_service.logout_all(auth_user.0.id).await?;

    let jar = clear_cookies(&state, jar);
    Ok((jar, Json(MessageResponse { message: "Logged out everywhere".to_string() })))
}

pub async fn me(auth_user: AuthUser, State(state): State<AppState>) -> Result<impl IntoResponse> {
    let user = state.auth_service.current_user(auth_user.0.id).await?;
    Ok(Json(user))
}

pub async fn setup_password(
    State(state): State<AppState>,
    Json(payload): Json<SetupPassword>,
) -> Result<impl IntoResponse> {
    state.auth_service.setup_password(&payload.token, &payload.password).await?;
    Ok(Json(MessageResponse { message: "Password set, you can now log in".to_string() }))
}

/// Identical response whether or not the account exists.
pub async fn forgot_password(
    State(state): State<AppState>,
    meta: ClientMeta,
    Json(payload): Json<ForgotPassword>,
) -> Result<impl IntoResponse> {
    let limits = &state.config.rate_limit;
    enforce(state.rate_limit_service.check_forgot_password(
        client_ip(&meta),
        &canonical_email(&payload.email),
        limits.forgot_window_secs,
        limits.forgot_max,
    ))?;

    state.auth_service.forgot_password(&payload.email).await?;
    Ok(Json(MessageResponse {
        message: "If that account exists, a reset link has been sent".to_string(),
    }))
}

pub async fn reset_password(
    State(state): State<AppState>,
    meta: ClientMeta,
    Json(payload): Json<ResetPassword>,
) -> Result<impl IntoResponse> {
    let limits = &state.config.rate_limit;
    enforce(state.rate_limit_service.check_reset_password(client_ip(&meta), limits.reset_window_secs, limits.reset_max))?;

    state.auth_service.reset_password(&payload.token, &payload.password).await?;
    Ok(Json(MessageResponse { message: "Password reset, please log in again".to_string() }))
}

pub async fn verify_user(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let outcome = state.auth_service.verify_user(user_id).await?;

    let warning =
        (!outcome.email_sent).then(|| "verification saved, but the setup email failed to send".to_string());
    Ok(Json(VerifyResponse { user: outcome.user, warning }))
}

fn session_response(state: &AppState, jar: CookieJar, session: AuthSession) -> (CookieJar, Json<SessionResponse>) {
    let auth = &state.config.auth;
    let access_max_age = i64::try_from(auth.access_token_ttl_secs).unwrap_or(900);
    let jar = jar
        .add(cookies::refresh_cookie(auth, &session.refresh_token, session.refresh_max_age_secs))
        .add(cookies::access_cookie(auth, &session.access_token, access_max_age));

    (jar, Json(SessionResponse { access_token: session.access_token, expires_at: session.expires_at }))
}

fn clear_cookies(state: &AppState, jar: CookieJar) -> CookieJar {
    let auth = &state.config.auth;
    jar.add(cookies::clear_refresh_cookie(auth)).add(cookies::clear_access_cookie(auth))
}

fn client_ip(meta: &ClientMeta) -> IpAddr {
    meta.ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

const fn enforce(decision: Decision) -> Result<()> {
    match decision {
        Decision::Allowed => Ok(()),
        Decision::Rejected { retry_after_secs } => Err(AppError::RateLimited { retry_after_secs }),
    }
}
