use axum::http::StatusCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::support::{always, spawn_gateway, spawn_upstream, AccountFixture, Responder};

// Requests issued by the test client carry no session headers, so the
// gateway keys sticky routing on the loopback peer address.
const IP_SESSION_KEY: &str = "ip:127.0.0.1";

fn codex_base(mock_base: &str) -> String {
    format!("{}/backend-api/codex", mock_base)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let upstream = spawn_upstream(always(StatusCode::OK, "{}")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
    })
    .await;

    let response = gateway
        .client
        .get(format!("{}/health", gateway.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "status": "ok" }));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn happy_path_streams_upstream_body_and_binds_sticky() {
    let upstream = spawn_upstream(always(StatusCode::OK, r#"{"ok":true}"#)).await;
    let gateway = spawn_gateway(
        &[AccountFixture::opaque("alpha"), AccountFixture::opaque("beta")],
        Some("alpha"),
        |c| c.base_url = codex_base(&upstream.base_url),
    )
    .await;

    let response = gateway.post_json("/v1/x", r#"{"k":1}"#).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true }));

    // default account first, path joined onto the base
    assert_eq!(*upstream.bearers.lock().await, ["Bearer access-alpha"]);
    assert_eq!(*upstream.paths.lock().await, ["/backend-api/codex/v1/x"]);

    let (failures, cooldown, last_error) = gateway.pool.state_snapshot("alpha").await.unwrap();
    assert_eq!(failures, 0);
    assert_eq!(cooldown, 0);
    assert!(last_error.is_none());
    assert_eq!(
        gateway.pool.sticky_target(IP_SESSION_KEY).as_deref(),
        Some("alpha")
    );
}

#[tokio::test]
async fn quota_rotation_switches_account_and_tracks_reset_time() {
    let resets_at = chrono::Utc::now().timestamp() + 7_200;
    let responder: Responder = Arc::new(move |call| {
        if call.bearer.as_deref() == Some("Bearer access-alpha") {
            let body = serde_json::json!({
                "error": { "type": "usage_limit_reached", "resets_at": resets_at }
            });
            (StatusCode::TOO_MANY_REQUESTS, body.to_string())
        } else {
            (StatusCode::OK, "{}".to_string())
        }
    });
    let upstream = spawn_upstream(responder).await;
    let gateway = spawn_gateway(
        &[AccountFixture::opaque("alpha"), AccountFixture::opaque("beta")],
        Some("alpha"),
        |c| c.base_url = codex_base(&upstream.base_url),
    )
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 200);

    // alpha cools down until the advertised reset, sticky moves to beta
    let (failures, cooldown, last_error) = gateway.pool.state_snapshot("alpha").await.unwrap();
    assert_eq!(failures, 1);
    assert_eq!(cooldown, resets_at * 1000);
    assert_eq!(last_error.as_deref(), Some("usage_limit_reached"));
    assert_eq!(
        gateway.pool.sticky_target(IP_SESSION_KEY).as_deref(),
        Some("beta")
    );
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn single_account_quota_exhausts_the_pool() {
    let body = r#"{"error":{"type":"usage_limit_reached"}}"#;
    let upstream = spawn_upstream(always(StatusCode::TOO_MANY_REQUESTS, body)).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
    })
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "all_accounts_exhausted" }));

    // the account is now cooling down, so a follow-up request short-circuits
    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 429);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_upstream_recovers_within_the_attempt() {
    let responder: Responder = Arc::new(|call| {
        if call.index < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "\"overloaded\"".to_string())
        } else {
            (StatusCode::OK, r#"{"done":true}"#.to_string())
        }
    });
    let upstream = spawn_upstream(responder).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
        c.upstream_max_retries = 2;
    })
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "done": true }));

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    let (failures, cooldown, _) = gateway.pool.state_snapshot("alpha").await.unwrap();
    assert_eq!(failures, 0);
    assert_eq!(cooldown, 0);
}

#[tokio::test]
async fn transient_budget_exhaustion_surfaces_the_last_status() {
    let upstream = spawn_upstream(always(StatusCode::SERVICE_UNAVAILABLE, "\"down\"")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
        c.upstream_max_retries = 1;
    })
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 503);
    // one original call plus one retry
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn id_token_rescues_a_rejected_access_token() {
    let responder: Responder = Arc::new(|call| {
        if call.bearer.as_deref() == Some("Bearer id-token-alpha") {
            (StatusCode::OK, r#"{"ok":1}"#.to_string())
        } else {
            (StatusCode::UNAUTHORIZED, "\"bad token\"".to_string())
        }
    });
    let upstream = spawn_upstream(responder).await;
    let gateway = spawn_gateway(
        &[AccountFixture {
            name: "alpha",
            access_token: "access-alpha".to_string(),
            id_token: Some("id-token-alpha".to_string()),
        }],
        None,
        |c| c.base_url = codex_base(&upstream.base_url),
    )
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 200);

    // exactly two upstream calls within the same attempt, account unharmed
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        *upstream.bearers.lock().await,
        ["Bearer access-alpha", "Bearer id-token-alpha"]
    );
    let (failures, cooldown, last_error) = gateway.pool.state_snapshot("alpha").await.unwrap();
    assert_eq!(failures, 0);
    assert_eq!(cooldown, 0);
    assert!(last_error.is_none());
}

#[tokio::test]
async fn auth_failure_without_id_token_rotates_and_penalises() {
    let upstream = spawn_upstream(always(StatusCode::UNAUTHORIZED, "\"denied\"")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
    })
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    // the only account is excluded, so the pool comes up empty
    assert_eq!(response.status(), 429);

    let (failures, cooldown, last_error) = gateway.pool.state_snapshot("alpha").await.unwrap();
    assert_eq!(failures, 1);
    assert_eq!(last_error.as_deref(), Some("http_401"));
    let now = chrono::Utc::now().timestamp_millis();
    assert!(cooldown > now + 50_000 && cooldown <= now + 61_000);
}

#[tokio::test]
async fn sticky_sessions_reuse_the_same_account() {
    let upstream = spawn_upstream(always(StatusCode::OK, "{}")).await;
    let gateway = spawn_gateway(
        &[AccountFixture::opaque("alpha"), AccountFixture::opaque("beta")],
        None,
        |c| c.base_url = codex_base(&upstream.base_url),
    )
    .await;

    for _ in 0..2 {
        let response = gateway
            .client
            .post(format!("{}/v1/x", gateway.base_url))
            .header("x-session-id", "sess-42")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let bearers = upstream.bearers.lock().await.clone();
    assert_eq!(bearers.len(), 2);
    assert_eq!(bearers[0], bearers[1]);
    assert_eq!(
        gateway.pool.sticky_target("sess-42").as_deref(),
        Some("alpha")
    );
}

#[tokio::test]
async fn fatal_status_and_body_pass_through_unchanged() {
    let upstream = spawn_upstream(always(StatusCode::NOT_FOUND, "no such route")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
    })
    .await;

    let response = gateway.post_json("/v1/x", "{}").await;
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "no such route");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn passthrough_mode_keeps_the_client_bearer() {
    let upstream = spawn_upstream(always(StatusCode::OK, "{}")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
        c.override_auth = false;
    })
    .await;

    let response = gateway
        .client
        .post(format!("{}/v1/x", gateway.base_url))
        .header("authorization", "Bearer client-token")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(*upstream.bearers.lock().await, ["Bearer client-token"]);
}

#[tokio::test]
async fn responses_path_is_rewritten_to_compact_through_the_gateway() {
    let upstream = spawn_upstream(always(StatusCode::OK, "{}")).await;
    let gateway = spawn_gateway(&[AccountFixture::opaque("alpha")], None, |c| {
        c.base_url = codex_base(&upstream.base_url);
    })
    .await;

    let response = gateway
        .post_json("/backend-api/codex/v1/responses/foo?x=1", "{}")
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        *upstream.paths.lock().await,
        ["/backend-api/codex/responses/compact"]
    );
}
