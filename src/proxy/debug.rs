use axum::http::{header, HeaderMap};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

// Process-wide diagnostic switches, safe to flip at runtime.
static DEBUG_HEADERS: AtomicBool = AtomicBool::new(false);
static CAPTURE_BODIES: AtomicBool = AtomicBool::new(false);

pub fn init_from_env() {
    let on = |key: &str| {
        std::env::var(key)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    };
    set_debug_headers(on("SWITCHYARD_DEBUG_HEADERS"));
    set_capture_bodies(on("SWITCHYARD_DEBUG_BODIES"));
}

pub fn set_debug_headers(enabled: bool) {
    DEBUG_HEADERS.store(enabled, Ordering::Relaxed);
}

pub fn debug_headers_enabled() -> bool {
    DEBUG_HEADERS.load(Ordering::Relaxed)
}

pub fn set_capture_bodies(enabled: bool) {
    CAPTURE_BODIES.store(enabled, Ordering::Relaxed);
}

pub fn capture_bodies_enabled() -> bool {
    CAPTURE_BODIES.load(Ordering::Relaxed)
}

// Bearer tokens and cookies never reach the log, even in debug mode.
pub fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if name == header::AUTHORIZATION || name == header::COOKIE {
                "<redacted>".to_string()
            } else {
                value.to_str().unwrap_or("<non-utf8>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

pub fn log_request(trace_id: &str, headers: &HeaderMap, body: &Bytes) {
    if debug_headers_enabled() {
        debug!("[{}] inbound headers: {:?}", trace_id, redacted_headers(headers));
    }
    if capture_bodies_enabled() {
        debug!(
            "[{}] inbound body ({} bytes): {}",
            trace_id,
            body.len(),
            String::from_utf8_lossy(body)
        );
    }
}
