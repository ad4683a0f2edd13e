use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

const REGISTRY_FILE: &str = "accounts.json";
const TOKEN_FILE: &str = "auth.json";
const STATUS_FILE: &str = "status.json";

// Token material as persisted on disk, one file per account directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    tokens: StoredTokens,
    #[serde(default)]
    last_refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Registry {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    accounts: Vec<String>,
}

// Field-wise patch merged into an account's status file. Every field is
// optional; absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<i64>,
}

// On-disk account store consumed by the pool. The CLI that creates and
// removes accounts writes the same layout; the gateway only reads the
// registry and rewrites token/status files.
pub trait AccountStore: Send + Sync {
    // Ordered account list, the nominated default first, then the rest in
    // registered order.
    fn load_ordered_accounts(&self) -> GatewayResult<Vec<(String, PathBuf)>>;

    fn load_tokens(&self, account_dir: &Path) -> Option<StoredTokens>;

    fn save_tokens(&self, account_dir: &Path, tokens: &StoredTokens) -> GatewayResult<()>;

    // Best-effort status bookkeeping; failures are logged, never surfaced.
    fn record_status(&self, name: &str, patch: &StatusPatch);
}

pub struct FsAccountStore {
    root: PathBuf,
}

fn is_valid_account_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

impl FsAccountStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn read_registry(&self) -> GatewayResult<Registry> {
        let path = self.root.join(REGISTRY_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Store(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Store(format!("malformed {}: {}", path.display(), e)))
    }
}

impl AccountStore for FsAccountStore {
    fn load_ordered_accounts(&self) -> GatewayResult<Vec<(String, PathBuf)>> {
        let registry = self.read_registry()?;

        let mut names: Vec<String> = Vec::with_capacity(registry.accounts.len());
        for name in registry.accounts {
            if !is_valid_account_name(&name) {
                warn!("[W-STORE-NAME] skipping_invalid_account_name: {}", name);
                continue;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }

        if let Some(default) = registry.default {
            if let Some(pos) = names.iter().position(|n| *n == default) {
                let default = names.remove(pos);
                names.insert(0, default);
            } else {
                warn!(
                    "[W-STORE-DEFAULT] default_account_not_registered: {}",
                    default
                );
            }
        }

        Ok(names
            .into_iter()
            .map(|name| {
                let dir = self.root.join(&name);
                (name, dir)
            })
            .collect())
    }

    fn load_tokens(&self, account_dir: &Path) -> Option<StoredTokens> {
        let path = account_dir.join(TOKEN_FILE);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<TokenFile>(&raw) {
            Ok(file) => Some(file.tokens),
            Err(e) => {
                warn!(
                    "[W-STORE-TOKENS] malformed_token_file {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    fn save_tokens(&self, account_dir: &Path, tokens: &StoredTokens) -> GatewayResult<()> {
        std::fs::create_dir_all(account_dir)?;
        let file = TokenFile {
            tokens: tokens.clone(),
            last_refresh: Some(chrono::Utc::now().to_rfc3339()),
        };
        let serialized = serde_json::to_string_pretty(&file)
            .map_err(|e| GatewayError::Store(format!("cannot serialize tokens: {}", e)))?;
        write_atomic(&account_dir.join(TOKEN_FILE), &serialized)?;
        Ok(())
    }

    fn record_status(&self, name: &str, patch: &StatusPatch) {
        let path = self.root.join(name).join(STATUS_FILE);
        let mut status: serde_json::Value = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let patch_value = match serde_json::to_value(patch) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return,
        };
        if let Some(obj) = status.as_object_mut() {
            for (key, value) in patch_value {
                obj.insert(key, value);
            }
        }

        if let Err(e) = write_atomic(&path, &status.to_string()) {
            debug!("status write for {} failed: {}", name, e);
        }
    }
}
