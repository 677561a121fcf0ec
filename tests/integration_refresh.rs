use reqwest::StatusCode;
use serde_json::json;

mod common;

/// A client without a cookie store, so each request presents exactly the
/// refresh token the test chooses.
fn bare_client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn login_for_refresh_cookie(
    app: &common::TestApp,
    client: &reqwest::Client,
    email: &str,
    password: &str,
) -> String {
    let resp = client
        .post(format!("{}/auth/login", app.server_url))
        .json(&json!({ "email": email, "password": password }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    common::extract_cookie(&resp, "reportdesk_refresh").expect("login must set the refresh cookie")
}

async fn refresh_with(
    app: &common::TestApp,
    client: &reqwest::Client,
    refresh_token: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/auth/refresh", app.server_url))
        .header("Cookie", format!("reportdesk_refresh={refresh_token}"))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_refresh_rotates_and_invalidates_old_token() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("rot@x.com", "Passw0rd123").await;
    let client = bare_client();

    let first = login_for_refresh_cookie(&app, &client, "rot@x.com", "Passw0rd123").await;

    let resp = refresh_with(&app, &client, &first).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second = common::extract_cookie(&resp, "reportdesk_refresh").unwrap();
    assert_ne!(first, second, "rotation must mint a fresh refresh token");

    // The new access token is live.
    let body: serde_json::Value = resp.json().await.unwrap();
    let access = body["accessToken"].as_str().unwrap();
    let resp = client
        .get(format!("{}/auth/me", app.server_url))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Exactly one live record survives the rotation.
    assert_eq!(app.ledger.live_count_for_user(user_id), 1);

    // The consumed token is gone, not merely flagged.
    let resp = refresh_with(&app, &client, &first).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "TOKEN_NOT_FOUND");
}

#[tokio::test]
async fn test_concurrent_refresh_has_single_winner() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("race@x.com", "Passw0rd123").await;
    let client = bare_client();

    let token = login_for_refresh_cookie(&app, &client, "race@x.com", "Passw0rd123").await;

    let (a, b) = tokio::join!(
        refresh_with(&app, &client, &token),
        refresh_with(&app, &client, &token),
    );

    let statuses = [a.status(), b.status()];
    let winners = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(winners, 1, "exactly one refresh may win, got {statuses:?}");

    let loser = if a.status() == StatusCode::OK { b } else { a };
    assert_eq!(loser.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = loser.json().await.unwrap();
    let code = body["code"].as_str().unwrap();
    assert!(
        code == "TOKEN_NOT_FOUND" || code == "TOKEN_REVOKED",
        "unexpected loser code {code}"
    );

    assert_eq!(app.ledger.live_count_for_user(user_id), 1);
}

#[tokio::test]
async fn test_logout_revokes_and_replay_nukes_the_rest() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("replay@x.com", "Passw0rd123").await;
    let client = bare_client();

    // Two independent sessions for the same account.
    let session_a = login_for_refresh_cookie(&app, &client, "replay@x.com", "Passw0rd123").await;
    let session_b = login_for_refresh_cookie(&app, &client, "replay@x.com", "Passw0rd123").await;
    assert_eq!(app.ledger.live_count_for_user(user_id), 2);

    // Logout flags session A's record as revoked and clears the cookies.
    let resp = client
        .post(format!("{}/auth/logout", app.server_url))
        .header("Cookie", format!("reportdesk_refresh={session_a}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cleared = common::extract_cookie(&resp, "reportdesk_refresh");
    assert!(cleared.is_none(), "logout must clear the refresh cookie");
    assert_eq!(app.ledger.live_count_for_user(user_id), 1);

    // Presenting the revoked token again is treated as theft: every other
    // session for the account goes down with it.
    let resp = refresh_with(&app, &client, &session_a).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "TOKEN_REVOKED");
    assert_eq!(app.ledger.live_count_for_user(user_id), 0);

    let resp = refresh_with(&app, &client, &session_b).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "TOKEN_REVOKED");
}

#[tokio::test]
async fn test_logout_accepts_body_token() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("body@x.com", "Passw0rd123").await;
    let client = bare_client();

    let token = login_for_refresh_cookie(&app, &client, "body@x.com", "Passw0rd123").await;

    let resp = client
        .post(format!("{}/auth/logout", app.server_url))
        .json(&json!({ "refreshToken": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.ledger.live_count_for_user(user_id), 0);
}

#[tokio::test]
async fn test_logout_accepts_bearer_header_token() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("hdr@x.com", "Passw0rd123").await;
    let client = bare_client();

    let token = login_for_refresh_cookie(&app, &client, "hdr@x.com", "Passw0rd123").await;

    let resp = client
        .post(format!("{}/auth/logout", app.server_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.ledger.live_count_for_user(user_id), 0);
}

#[tokio::test]
async fn test_logout_without_token_still_succeeds() {
    let app = common::TestApp::spawn().await;

    let resp = app
        .client
        .post(format!("{}/auth/logout", app.server_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_logout_all_kills_every_session() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("all@x.com", "Passw0rd123").await;
    let client = bare_client();

    let tokens = [
        login_for_refresh_cookie(&app, &client, "all@x.com", "Passw0rd123").await,
        login_for_refresh_cookie(&app, &client, "all@x.com", "Passw0rd123").await,
        login_for_refresh_cookie(&app, &client, "all@x.com", "Passw0rd123").await,
    ];
    assert_eq!(app.ledger.live_count_for_user(user_id), 3);

    let resp = app.login("all@x.com", "Passw0rd123").await;
    let access = resp.json::<serde_json::Value>().await.unwrap()["accessToken"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = client
        .post(format!("{}/auth/logout-all", app.server_url))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.ledger.live_count_for_user(user_id), 0);

    for token in &tokens {
        let resp = refresh_with(&app, &client, token).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_expired_record_is_rejected_and_deleted() {
    let app = common::TestApp::spawn().await;
    let user_id = app.onboard_user("stale@x.com", "Passw0rd123").await;
    let client = bare_client();

    let token = login_for_refresh_cookie(&app, &client, "stale@x.com", "Passw0rd123").await;

    let ids = app.ledger.record_ids_for_user(user_id);
    assert_eq!(ids.len(), 1);
    app.ledger.force_expire(ids[0]);

    let resp = refresh_with(&app, &client, &token).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "TOKEN_EXPIRED");

    assert!(app.ledger.record_ids_for_user(user_id).is_empty());
}

#[tokio::test]
async fn test_refresh_without_cookie_is_unauthorized() {
    let app = common::TestApp::spawn().await;
    let client = bare_client();

    let resp = client.post(format!("{}/auth/refresh", app.server_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "INVALID_TOKEN");
}

#[tokio::test]
async fn test_refresh_with_garbage_token_is_unauthorized() {
    let app = common::TestApp::spawn().await;
    let client = bare_client();

    let resp = refresh_with(&app, &client, "not-a-jwt").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str().unwrap(), "INVALID_TOKEN");
}
