use crate::domain::user::SafeUser;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct Registration {
    pub email: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct Login {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Logout {
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
pub struct SetupPassword {
    pub token: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ForgotPassword {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetPassword {
    pub token: String,
    pub password: String,
}

/// Session-establishing response body. The refresh token travels only in
/// the Set-Cookie header, never in the body.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub user: SafeUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
