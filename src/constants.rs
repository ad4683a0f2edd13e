use std::sync::LazyLock;

// OAuth client id registered for the Codex CLI; refresh grants are issued
// against it regardless of which local client talks to the gateway.
pub const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";

// Access tokens within this many seconds of expiry are refreshed before use.
pub const TOKEN_FRESHNESS_BUFFER_SECS: i64 = 90;

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "switchyard/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
