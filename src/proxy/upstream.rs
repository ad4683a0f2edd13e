use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::models::GatewayConfig;

const ERROR_BODY_LIMIT: usize = 4096;

// Outcome of one upstream dispatch, after the internal transient-retry loop.
pub enum ForwardResult {
    // 2xx; body still streaming
    Ok(reqwest::Response),
    // 401 / 403
    AuthFailure { status: u16, body: String },
    // usage_limit_reached body or plain 429; resets_at in ms when reported
    Quota { resets_at: Option<i64>, body: String },
    // 5xx, connection error, or per-attempt timeout (502/504)
    Transient { status: u16, body: String },
    // any other non-2xx, written through to the client verbatim
    Fatal { status: u16, body: String },
    // client went away (499 client_aborted); nothing is written back
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct RetryTuning {
    max_retries: u32,
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    request_timeout_ms: u64,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base: Url,
    tuning: RetryTuning,
}

fn truncate_body(body: String) -> String {
    if body.len() <= ERROR_BODY_LIMIT {
        body
    } else {
        body.chars().take(ERROR_BODY_LIMIT).collect()
    }
}

// A quota rejection is recognised by the structured error type or by a
// plain 429. `resets_at` rides along as epoch seconds.
fn parse_quota_body(body: &str) -> (bool, Option<i64>) {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return (false, None);
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return (false, None);
    };
    let error = json.get("error");
    let is_quota = error
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .map(|t| t == "usage_limit_reached")
        .unwrap_or(false);
    let resets_at = error
        .and_then(|e| e.get("resets_at"))
        .and_then(|v| v.as_i64())
        .map(|secs| secs * 1000);
    (is_quota, resets_at)
}

fn classify_error(status: u16, body: String) -> ForwardResult {
    let (quota_body, resets_at) = parse_quota_body(&body);
    if quota_body || status == 429 {
        return ForwardResult::Quota {
            resets_at,
            body: truncate_body(body),
        };
    }
    match status {
        401 | 403 => ForwardResult::AuthFailure {
            status,
            body: truncate_body(body),
        },
        500..=599 => ForwardResult::Transient {
            status,
            body: truncate_body(body),
        },
        _ => ForwardResult::Fatal { status, body },
    }
}

// Delay before retry `attempt` (0-indexed): exponential growth capped at
// max_ms, plus uniform jitter.
pub(crate) fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(max_ms);
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..jitter_ms)
    } else {
        0
    };
    exponential + jitter
}

impl UpstreamClient {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let base = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| GatewayError::Config(format!("invalid base_url: {}", e)))?;
        // Per-attempt deadlines come from tokio::time::timeout; the client
        // itself only bounds connection establishment. Redirects pass
        // through to the client instead of being followed here.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()?;
        Ok(Self {
            client,
            base,
            tuning: RetryTuning {
                max_retries: config.upstream_max_retries,
                base_ms: config.upstream_retry_base_ms,
                max_ms: config.upstream_retry_max_ms,
                jitter_ms: config.upstream_retry_jitter_ms,
                request_timeout_ms: config.request_timeout_ms,
            },
        })
    }

    fn origin(&self) -> String {
        let mut origin = format!(
            "{}://{}",
            self.base.scheme(),
            self.base.host_str().unwrap_or_default()
        );
        if let Some(port) = self.base.port() {
            origin.push_str(&format!(":{}", port));
        }
        origin
    }

    // Join the inbound path onto the configured base. One compatibility
    // shim: `…/v1/responses*` under the codex backend is redirected to the
    // compact responses endpoint, query dropped.
    pub fn build_target_url(&self, path: &str, query: Option<&str>) -> String {
        let base_path = self.base.path().trim_end_matches('/');
        if base_path.ends_with("/backend-api/codex")
            && path.starts_with("/backend-api/codex/v1/responses")
        {
            return format!("{}/backend-api/codex/responses/compact", self.origin());
        }
        let mut target = format!("{}{}{}", self.origin(), base_path, path);
        if let Some(q) = query {
            if !q.is_empty() {
                target.push('?');
                target.push_str(q);
            }
        }
        target
    }

    async fn single_attempt(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: &Bytes,
        cancel: &CancellationToken,
    ) -> ForwardResult {
        let request = self
            .client
            .request(method.clone(), target)
            .headers(headers.clone())
            .body(body.clone());

        let send = tokio::time::timeout(
            Duration::from_millis(self.tuning.request_timeout_ms),
            request.send(),
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return ForwardResult::Aborted,
            outcome = send => outcome,
        };

        let response = match outcome {
            Err(_) => {
                if cancel.is_cancelled() {
                    return ForwardResult::Aborted;
                }
                return ForwardResult::Transient {
                    status: 504,
                    body: "upstream_timeout".to_string(),
                };
            }
            Ok(Err(e)) => {
                return ForwardResult::Transient {
                    status: 502,
                    body: truncate_body(format!("upstream_unreachable: {}", e)),
                };
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            return ForwardResult::Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        classify_error(status.as_u16(), body)
    }

    // Dispatch one attempt to the upstream, retrying transient failures
    // with capped exponential backoff. Quota, auth, and fatal outcomes are
    // returned immediately for the router to act on.
    pub async fn fetch(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: &Bytes,
        cancel: &CancellationToken,
    ) -> ForwardResult {
        let mut attempt: u32 = 0;
        loop {
            match self.single_attempt(method, target, headers, body, cancel).await {
                ForwardResult::Transient { status, body } if attempt < self.tuning.max_retries => {
                    let delay = backoff_delay_ms(
                        attempt,
                        self.tuning.base_ms,
                        self.tuning.max_ms,
                        self.tuning.jitter_ms,
                    );
                    warn!(
                        "Upstream transient {} ({}), retry {}/{} in {}ms",
                        status,
                        body,
                        attempt + 1,
                        self.tuning.max_retries,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return ForwardResult::Aborted,
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                    attempt += 1;
                }
                result => {
                    if attempt > 0 {
                        debug!("Upstream attempt settled after {} retries", attempt);
                    }
                    return result;
                }
            }
        }
    }
}
