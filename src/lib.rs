pub mod auth;
pub mod constants;
pub mod error;
mod models;
mod proxy;
pub mod store;
#[cfg(test)]
mod test_utils;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

pub use models::GatewayConfig;
pub use store::FsAccountStore;

fn init_logger() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// Gateway home: SWITCHYARD_HOME, or ~/.switchyard. Holds config.json and
// the accounts/ store.
fn gateway_home() -> PathBuf {
    if let Ok(home) = std::env::var("SWITCHYARD_HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home.trim());
        }
    }
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".switchyard")
}

pub fn run() {
    init_logger();
    proxy::debug::init_from_env();

    let home = gateway_home();
    let mut config = GatewayConfig::load(&home.join("config.json"));
    models::apply_env_overrides(&mut config);
    if let Err(errors) = config.validate() {
        error!(
            "[E-CONFIG-INVALID] configuration_validation_failed:\n{}",
            errors.join("\n")
        );
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let store = Arc::new(FsAccountStore::new(home.join("accounts")));
        let server = match proxy::server::start(config, store).await {
            Ok(server) => server,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        };

        info!("Gateway is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down gateway");
        server.shutdown().await;
    });
}
