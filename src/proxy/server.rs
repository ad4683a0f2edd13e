use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::refresh::OauthRefresher;
use crate::error::{GatewayError, GatewayResult};
use crate::models::GatewayConfig;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;
use crate::store::AccountStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: Arc<AccountPool>,
    pub upstream: Arc<UpstreamClient>,
    // Cancelled on shutdown; request handlers derive child tokens from it.
    pub shutdown: CancellationToken,
}

async fn health_check_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

// Body size ceiling for buffered inbound requests, default 100MB.
pub(crate) fn request_body_limit() -> usize {
    std::env::var("SWITCHYARD_MAX_BODY_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100 * 1024 * 1024)
}

pub(crate) fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .fallback(crate::proxy::router::proxy_request)
        .layer(DefaultBodyLimit::max(request_body_limit()))
        .with_state(state)
}

pub struct GatewayServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    drain_timeout: Duration,
}

pub async fn start(
    config: GatewayConfig,
    store: Arc<dyn AccountStore>,
) -> GatewayResult<GatewayServer> {
    let config = Arc::new(config);
    let refresher = Arc::new(OauthRefresher::new(
        config.token_endpoint.clone(),
        config.oauth_client_id.clone(),
    ));
    let pool = Arc::new(AccountPool::load(
        store,
        refresher,
        config.auth_cooldown_seconds,
    )?);
    if pool.is_empty() {
        warn!("[W-POOL-EMPTY] no_usable_accounts_loaded");
    }
    let upstream = Arc::new(UpstreamClient::new(&config)?);

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: config.clone(),
        pool,
        upstream,
        shutdown: shutdown.clone(),
    };
    let app = build_app(state);

    let bind = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| GatewayError::Config(format!("Address {} binding failed: {}", bind, e)))?;
    let addr = listener.local_addr()?;
    info!("Gateway listening at http://{}", addr);

    let signal = shutdown.clone();
    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
        {
            error!("[E-SERVER] server_terminated_with_error: {:?}", e);
        }
    });

    Ok(GatewayServer {
        addr,
        shutdown,
        handle,
        drain_timeout: Duration::from_millis(config.request_timeout_ms),
    })
}

impl GatewayServer {
    // Stop accepting, let in-flight requests drain up to the per-attempt
    // timeout, then give up on them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(self.drain_timeout, self.handle)
            .await
            .is_err()
        {
            warn!("[W-SHUTDOWN-DRAIN] in_flight_requests_did_not_drain_in_time");
        }
    }
}
