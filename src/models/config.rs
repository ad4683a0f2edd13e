use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

// Immutable runtime parameters for the gateway. Loaded once at startup from
// an optional config.json, then overridden by environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    pub base_url: String,
    pub oauth_client_id: String,
    pub token_endpoint: String,
    // Quota penalty applied when the upstream does not report a reset time.
    pub cooldown_seconds: u64,
    // Penalty box for accounts that fail authentication upstream.
    pub auth_cooldown_seconds: u64,
    // Extra attempts beyond the pool size before the router surrenders.
    pub max_retry_passes: u32,
    pub request_timeout_ms: u64,
    pub upstream_max_retries: u32,
    pub upstream_retry_base_ms: u64,
    pub upstream_retry_max_ms: u64,
    pub upstream_retry_jitter_ms: u64,
    pub override_auth: bool,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 4319,
            base_url: crate::constants::DEFAULT_BASE_URL.to_string(),
            oauth_client_id: crate::constants::OAUTH_CLIENT_ID.to_string(),
            token_endpoint: crate::constants::TOKEN_ENDPOINT.to_string(),
            cooldown_seconds: 900,
            auth_cooldown_seconds: 60,
            max_retry_passes: 1,
            request_timeout_ms: 120_000,
            upstream_max_retries: 2,
            upstream_retry_base_ms: 200,
            upstream_retry_max_ms: 2_000,
            upstream_retry_jitter_ms: 120,
            override_auth: true,
        }
    }

    // Read config.json if present; a missing file yields the defaults, a
    // malformed file is reported and ignored rather than aborting startup.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<GatewayConfig>(&raw) {
                Ok(config) => {
                    info!("Loaded gateway config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "[W-CONFIG-PARSE] ignoring_malformed_config_file {}: {}",
                        path.display(),
                        e
                    );
                    Self::new()
                }
            },
            Err(_) => Self::new(),
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("port must be non-zero".to_string());
        }
        if self.bind_address.trim().is_empty() {
            errors.push("bind_address must not be empty".to_string());
        }
        match url::Url::parse(&self.base_url) {
            Ok(u) if u.host_str().is_some() => {}
            _ => errors.push(format!("base_url is not a valid URL: {}", self.base_url)),
        }
        if url::Url::parse(&self.token_endpoint).is_err() {
            errors.push(format!(
                "token_endpoint is not a valid URL: {}",
                self.token_endpoint
            ));
        }
        if self.oauth_client_id.trim().is_empty() {
            errors.push("oauth_client_id must not be empty".to_string());
        }
        if self.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be non-zero".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Environment overrides beat the config file. Invalid values are reported
// and ignored so a typo never takes the gateway down.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(bind) = std::env::var("SWITCHYARD_BIND") {
        if !bind.trim().is_empty() {
            config.bind_address = bind.trim().to_string();
            info!("Using bind address from environment: {}", config.bind_address);
        }
    }

    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.port = p;
                    info!("Using gateway port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(base) = std::env::var("SWITCHYARD_BASE_URL") {
        if !base.trim().is_empty() {
            config.base_url = base.trim().trim_end_matches('/').to_string();
            info!("Using upstream base URL from environment: {}", config.base_url);
        }
    }

    if let Ok(client_id) = std::env::var("SWITCHYARD_OAUTH_CLIENT_ID") {
        if !client_id.trim().is_empty() {
            config.oauth_client_id = client_id.trim().to_string();
            info!("Using OAuth client id from environment");
        }
    }

    if let Ok(flag) = std::env::var("SWITCHYARD_OVERRIDE_AUTH") {
        match parse_env_bool(&flag) {
            Some(parsed) => {
                config.override_auth = parsed;
                info!("Using override_auth from environment: {}", parsed);
            }
            None => warn!(
                "[W-OVERRIDE-AUTH-INVALID] ignoring_invalid_override_auth_value: {}",
                flag
            ),
        }
    }

    if let Ok(secs) = std::env::var("SWITCHYARD_COOLDOWN_SECONDS") {
        match secs.trim().parse::<u64>() {
            Ok(s) if s > 0 => {
                config.cooldown_seconds = s;
                info!("Using quota cooldown from environment: {}s", s);
            }
            _ => warn!(
                "[W-COOLDOWN-INVALID] ignoring_invalid_cooldown_value: {}",
                secs
            ),
        }
    }

    if let Ok(ms) = std::env::var("SWITCHYARD_REQUEST_TIMEOUT_MS") {
        match ms.trim().parse::<u64>() {
            Ok(t) if t > 0 => {
                config.request_timeout_ms = t;
                info!("Using request timeout from environment: {}ms", t);
            }
            _ => warn!(
                "[W-TIMEOUT-INVALID] ignoring_invalid_request_timeout_value: {}",
                ms
            ),
        }
    }
}
