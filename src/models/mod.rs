mod config;

pub use config::{apply_env_overrides, GatewayConfig};
