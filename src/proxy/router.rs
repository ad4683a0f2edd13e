use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::proxy::debug as debug_log;
use crate::proxy::headers::build_forward_headers;
use crate::proxy::server::AppState;
use crate::proxy::upstream::ForwardResult;

// Header names consulted for the sticky-session key, in priority order.
const SESSION_KEY_HEADERS: [&str; 4] = [
    "x-session-id",
    "openai-session",
    "x-openai-session",
    "x-request-id",
];

pub(crate) fn resolve_session_key(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    for name in SESSION_KEY_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    match remote {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "default".to_string(),
    }
}

pub async fn proxy_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Response {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    match route(state, remote, request).await {
        Ok(response) => response,
        // Uncaught failures surface as a bare 500 message, never a trace.
        Err(message) => {
            warn!("request handling failed: {}", message);
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

async fn route(
    state: AppState,
    remote: Option<SocketAddr>,
    request: Request<Body>,
) -> Result<Response, String> {
    let (parts, inbound_body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let inbound_headers = parts.headers;

    // Buffer the body up front: retries replay it to other accounts, so
    // inbound streaming is not supported.
    let limit = crate::proxy::server::request_body_limit();
    let body = axum::body::to_bytes(inbound_body, limit)
        .await
        .map_err(|e| format!("body_read_failed: {}", e))?;

    let trace_id = format!("req_{}", chrono::Utc::now().timestamp_millis());
    debug_log::log_request(&trace_id, &inbound_headers, &body);

    let session_key = resolve_session_key(&inbound_headers, remote);
    let cancel = state.shutdown.child_token();
    let config = &state.config;
    let pool = &state.pool;

    let mut excluded: HashSet<String> = HashSet::new();
    let budget = config.max_retry_passes as usize + pool.len();
    let mut attempts = 0usize;

    while attempts < budget {
        attempts += 1;

        let account = match pool.sticky(&session_key, &excluded).await {
            Some(name) => name,
            None => match pool.pick(&excluded).await {
                Some(name) => name,
                None => {
                    info!("[{}] all accounts exhausted", trace_id);
                    return Ok((
                        StatusCode::TOO_MANY_REQUESTS,
                        Json(json!({ "error": "all_accounts_exhausted" })),
                    )
                        .into_response());
                }
            },
        };
        pool.assign(&session_key, &account);
        pool.mark_attempt(&account);

        let bearer = if config.override_auth {
            match pool.ensure_access_token(&account).await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("auth failure on {} ({})", account, e);
                    pool.mark_auth_failure(&account, "token_refresh_failed").await;
                    pool.clear_assignment(&session_key);
                    return Ok(
                        (StatusCode::UNAUTHORIZED, "missing_access_token").into_response()
                    );
                }
            }
        } else {
            None
        };
        // Snapshot after the potential refresh so injected claims match the
        // bearer that goes out.
        let tokens = pool.tokens_view(&account).await;

        let target = state.upstream.build_target_url(&path, query.as_deref());
        info!("{} {} -> {}", method, path, account);

        let forward_headers = build_forward_headers(
            &inbound_headers,
            config.override_auth,
            bearer.as_deref(),
            tokens.as_ref(),
        );
        let mut result = state
            .upstream
            .fetch(&method, &target, &forward_headers, &body, &cancel)
            .await;

        // A rejected access token gets one more shot with the id token as
        // bearer before the account is written off.
        let rejected_status = match &result {
            ForwardResult::AuthFailure { status, .. } => Some(*status),
            _ => None,
        };
        if let Some(status) = rejected_status {
            let id_token = tokens.as_ref().and_then(|t| t.id_token.clone());
            if config.override_auth {
                if let Some(id_token) = id_token {
                    debug!(
                        "[{}] {} rejected bearer ({}), retrying with id token",
                        trace_id, account, status
                    );
                    let retry_headers = build_forward_headers(
                        &inbound_headers,
                        true,
                        Some(&id_token),
                        tokens.as_ref(),
                    );
                    let retry = state
                        .upstream
                        .fetch(&method, &target, &retry_headers, &body, &cancel)
                        .await;
                    if matches!(retry, ForwardResult::Ok(_)) {
                        result = retry;
                    }
                }
            }
        }

        match result {
            ForwardResult::Ok(response) => {
                pool.mark_success(&account).await;
                return Ok(stream_upstream_response(response));
            }
            ForwardResult::Quota { resets_at, .. } => {
                info!("quota hit, switching from {}", account);
                excluded.insert(account.clone());
                pool.mark_quota(&account, config.cooldown_seconds, resets_at)
                    .await;
                pool.clear_assignment(&session_key);
            }
            ForwardResult::AuthFailure { status, .. } => {
                let reason = format!("http_{}", status);
                warn!("auth failure on {} ({})", account, reason);
                pool.mark_auth_failure(&account, &reason).await;
                excluded.insert(account.clone());
                pool.clear_assignment(&session_key);
            }
            ForwardResult::Transient { status, body } => {
                // Retry budget inside the upstream client is spent; pass
                // the terminal status through.
                warn!("upstream error {} on {}", status, account);
                return Ok(text_response(status, body));
            }
            ForwardResult::Fatal { status, body } => {
                warn!("upstream error {} on {}", status, account);
                return Ok(text_response(status, body));
            }
            ForwardResult::Aborted => {
                debug!("[{}] client aborted", trace_id);
                return Ok(text_response(499, String::new()));
            }
        }
    }

    warn!("[{}] attempt budget exhausted", trace_id);
    Ok((StatusCode::INTERNAL_SERVER_ERROR, "gateway_exhausted").into_response())
}

fn text_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, body).into_response()
}

// Write the upstream status and headers once, then copy the body chunk by
// chunk. Streamed bodies are never rewritten; dropping the returned
// response cancels the upstream read.
fn stream_upstream_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    let stream = response.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("response_build_failed: {}", e),
            )
                .into_response()
        })
}
