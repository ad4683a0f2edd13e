use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::refresh::OauthRefresher;
use crate::models::GatewayConfig;
use crate::proxy::pool::AccountPool;
use crate::proxy::server::{build_app, AppState};
use crate::proxy::upstream::UpstreamClient;
use crate::store::{AccountStore, FsAccountStore, StoredTokens};

// One observed call against the mock upstream.
pub(crate) struct UpstreamCall {
    pub index: usize,
    pub bearer: Option<String>,
}

pub(crate) type Responder = Arc<dyn Fn(&UpstreamCall) -> (StatusCode, String) + Send + Sync>;

#[derive(Clone)]
struct MockState {
    calls: Arc<AtomicUsize>,
    bearers: Arc<Mutex<Vec<String>>>,
    paths: Arc<Mutex<Vec<String>>>,
    responder: Responder,
}

pub(crate) struct MockUpstream {
    pub base_url: String,
    pub calls: Arc<AtomicUsize>,
    pub bearers: Arc<Mutex<Vec<String>>>,
    pub paths: Arc<Mutex<Vec<String>>>,
}

async fn mock_handler(State(state): State<MockState>, request: Request<Body>) -> Response {
    let index = state.calls.fetch_add(1, Ordering::SeqCst);
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(bearer) = &bearer {
        state.bearers.lock().await.push(bearer.clone());
    }
    let path = match request.uri().query() {
        Some(q) => format!("{}?{}", request.uri().path(), q),
        None => request.uri().path().to_string(),
    };
    state.paths.lock().await.push(path);

    let (status, body) = (state.responder)(&UpstreamCall { index, bearer });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("mock response")
}

pub(crate) async fn spawn_upstream(responder: Responder) -> MockUpstream {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        bearers: Arc::new(Mutex::new(Vec::new())),
        paths: Arc::new(Mutex::new(Vec::new())),
        responder,
    };
    let upstream = MockUpstream {
        base_url: String::new(),
        calls: state.calls.clone(),
        bearers: state.bearers.clone(),
        paths: state.paths.clone(),
    };

    let app = Router::new().fallback(mock_handler).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock upstream");
    });

    MockUpstream {
        base_url: format!("http://{}", addr),
        ..upstream
    }
}

// Fixed JSON success responder.
pub(crate) fn always(status: StatusCode, body: &str) -> Responder {
    let body = body.to_string();
    Arc::new(move |_| (status, body.clone()))
}

pub(crate) struct AccountFixture {
    pub name: &'static str,
    pub access_token: String,
    pub id_token: Option<String>,
}

impl AccountFixture {
    pub(crate) fn opaque(name: &'static str) -> Self {
        Self {
            name,
            access_token: format!("access-{}", name),
            id_token: None,
        }
    }
}

pub(crate) struct TestGateway {
    pub base_url: String,
    pub pool: Arc<AccountPool>,
    pub client: reqwest::Client,
    home: TempDir,
}

fn write_registry(root: &Path, default: Option<&str>, names: &[&str]) {
    let registry = serde_json::json!({ "default": default, "accounts": names });
    std::fs::write(root.join("accounts.json"), registry.to_string()).expect("write registry");
}

// Bring up a full gateway (store fixture on disk, pool, upstream client,
// axum app) on an ephemeral port.
pub(crate) async fn spawn_gateway(
    accounts: &[AccountFixture],
    default: Option<&str>,
    configure: impl FnOnce(&mut GatewayConfig),
) -> TestGateway {
    let home = TempDir::new().expect("gateway home");
    let store = FsAccountStore::new(home.path().to_path_buf());
    let names: Vec<&str> = accounts.iter().map(|a| a.name).collect();
    write_registry(home.path(), default, &names);
    for account in accounts {
        store
            .save_tokens(
                &home.path().join(account.name),
                &StoredTokens {
                    access_token: account.access_token.clone(),
                    refresh_token: format!("refresh-{}", account.name),
                    id_token: account.id_token.clone(),
                    account_id: None,
                },
            )
            .expect("save fixture tokens");
    }

    let mut config = GatewayConfig::new();
    // Fast backoff so transient-retry tests stay quick.
    config.upstream_retry_base_ms = 10;
    config.upstream_retry_max_ms = 40;
    config.upstream_retry_jitter_ms = 5;
    config.request_timeout_ms = 10_000;
    configure(&mut config);

    let refresher = Arc::new(OauthRefresher::new(
        config.token_endpoint.clone(),
        config.oauth_client_id.clone(),
    ));
    let pool = Arc::new(
        AccountPool::load(Arc::new(store), refresher, config.auth_cooldown_seconds)
            .expect("load pool"),
    );
    let upstream = Arc::new(UpstreamClient::new(&config).expect("upstream client"));
    let state = AppState {
        config: Arc::new(config),
        pool: pool.clone(),
        upstream,
        shutdown: CancellationToken::new(),
    };

    let app = build_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("gateway local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve gateway");
    });

    TestGateway {
        base_url: format!("http://{}", addr),
        pool,
        client: reqwest::Client::new(),
        home,
    }
}

impl TestGateway {
    pub(crate) fn home(&self) -> &Path {
        self.home.path()
    }

    pub(crate) async fn post_json(&self, path: &str, body: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("gateway request")
    }
}
