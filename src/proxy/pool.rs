use dashmap::DashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::refresh::OauthRefresher;
use crate::auth::tokens::{self, TokenPair};
use crate::constants::TOKEN_FRESHNESS_BUFFER_SECS;
use crate::store::{AccountStore, StatusPatch};

pub const QUOTA_ERROR: &str = "usage_limit_reached";

// Runtime state of one registered account.
#[derive(Debug)]
pub struct AccountState {
    pub tokens: TokenPair,
    // ms epoch; the account is ineligible for selection while now < cooldown_until
    pub cooldown_until: i64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

struct AccountSlot {
    name: String,
    account_dir: PathBuf,
    state: Mutex<AccountState>,
}

// In-memory pool of account states. Selection walks the configured order
// (default account first); all mutations go through the per-account mutex
// so a reader never observes a half-updated cooldown or counter.
pub struct AccountPool {
    slots: Vec<Arc<AccountSlot>>,
    // session_key -> account name
    sticky: DashMap<String, String>,
    // per-account single-flight refresh locks
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    store: Arc<dyn AccountStore>,
    refresher: Arc<OauthRefresher>,
    auth_cooldown_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl AccountPool {
    // Build the pool from the store. Accounts whose token file is missing
    // or lacks either token are dropped here, not at request time.
    pub fn load(
        store: Arc<dyn AccountStore>,
        refresher: Arc<OauthRefresher>,
        auth_cooldown_seconds: u64,
    ) -> crate::error::GatewayResult<Self> {
        let mut slots = Vec::new();
        for (name, account_dir) in store.load_ordered_accounts()? {
            let Some(stored) = store.load_tokens(&account_dir) else {
                warn!("[W-POOL-TOKENS] no_token_file_for_account: {}", name);
                continue;
            };
            if stored.access_token.trim().is_empty() || stored.refresh_token.trim().is_empty() {
                warn!("[W-POOL-TOKENS] incomplete_tokens_for_account: {}", name);
                continue;
            }
            let tokens = TokenPair::from_stored(stored);
            slots.push(Arc::new(AccountSlot {
                name,
                account_dir,
                state: Mutex::new(AccountState {
                    tokens,
                    cooldown_until: 0,
                    consecutive_failures: 0,
                    last_error: None,
                }),
            }));
        }

        info!("Account pool loaded with {} account(s)", slots.len());
        Ok(Self {
            slots,
            sticky: DashMap::new(),
            refresh_locks: DashMap::new(),
            store,
            refresher,
            auth_cooldown_ms: auth_cooldown_seconds as i64 * 1000,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, name: &str) -> Option<&Arc<AccountSlot>> {
        self.slots.iter().find(|s| s.name == name)
    }

    // First eligible account in pool order: not excluded, not cooling down.
    pub async fn pick(&self, excluded: &HashSet<String>) -> Option<String> {
        let now = now_ms();
        for slot in &self.slots {
            if excluded.contains(&slot.name) {
                continue;
            }
            let state = slot.state.lock().await;
            if state.cooldown_until <= now {
                return Some(slot.name.clone());
            }
        }
        None
    }

    // Sticky lookup: the bound account must still exist, must not be
    // excluded for this request, and must not be cooling down.
    pub async fn sticky(&self, session_key: &str, excluded: &HashSet<String>) -> Option<String> {
        let name = self.sticky.get(session_key).map(|v| v.clone())?;
        let Some(slot) = self.slot(&name) else {
            debug!("Sticky: bound account {} no longer in pool, unbinding", name);
            self.sticky.remove(session_key);
            return None;
        };
        if excluded.contains(&name) {
            return None;
        }
        let state = slot.state.lock().await;
        if state.cooldown_until <= now_ms() {
            Some(name)
        } else {
            None
        }
    }

    pub fn assign(&self, session_key: &str, account_name: &str) {
        self.sticky
            .insert(session_key.to_string(), account_name.to_string());
    }

    pub fn clear_assignment(&self, session_key: &str) {
        self.sticky.remove(session_key);
    }

    // Snapshot of the account's current token pair, for header construction
    // and the id-token fallback.
    pub async fn tokens_view(&self, name: &str) -> Option<TokenPair> {
        let slot = self.slot(name)?;
        let state = slot.state.lock().await;
        Some(state.tokens.clone())
    }

    // Status writes are best-effort and must never slow down or fail the
    // request path.
    fn record_status_async(&self, name: &str, patch: StatusPatch) {
        let store = self.store.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || store.record_status(&name, &patch));
    }

    pub fn mark_attempt(&self, name: &str) {
        self.record_status_async(
            name,
            StatusPatch {
                last_attempt_at: Some(chrono::Utc::now().to_rfc3339()),
                ..Default::default()
            },
        );
    }

    pub async fn mark_success(&self, name: &str) {
        let Some(slot) = self.slot(name) else {
            return;
        };
        {
            let mut state = slot.state.lock().await;
            state.consecutive_failures = 0;
            state.last_error = None;
            state.cooldown_until = 0;
        }
        self.record_status_async(
            name,
            StatusPatch {
                last_success_at: Some(chrono::Utc::now().to_rfc3339()),
                consecutive_failures: Some(0),
                cooldown_until_ms: Some(0),
                ..Default::default()
            },
        );
    }

    // Quota hit: honour the upstream reset time when it is in the future,
    // otherwise apply the configured penalty. The deadline never moves
    // backwards within an incident.
    pub async fn mark_quota(&self, name: &str, cooldown_seconds: u64, resets_at_ms: Option<i64>) {
        let Some(slot) = self.slot(name) else {
            return;
        };
        let now = now_ms();
        let candidate = match resets_at_ms {
            Some(resets_at) if resets_at > now => resets_at,
            _ => now + cooldown_seconds as i64 * 1000,
        };
        let (failures, cooldown_until) = {
            let mut state = slot.state.lock().await;
            state.consecutive_failures += 1;
            state.last_error = Some(QUOTA_ERROR.to_string());
            state.cooldown_until = state.cooldown_until.max(candidate);
            (state.consecutive_failures, state.cooldown_until)
        };
        info!(
            "Account {} on quota cooldown for {}s (failure #{})",
            name,
            (cooldown_until - now).max(0) / 1000,
            failures
        );
        self.record_status_async(
            name,
            StatusPatch {
                last_error: Some(QUOTA_ERROR.to_string()),
                consecutive_failures: Some(failures),
                cooldown_until_ms: Some(cooldown_until),
                ..Default::default()
            },
        );
    }

    pub async fn mark_auth_failure(&self, name: &str, reason: &str) {
        let Some(slot) = self.slot(name) else {
            return;
        };
        let candidate = now_ms() + self.auth_cooldown_ms;
        let (failures, cooldown_until) = {
            let mut state = slot.state.lock().await;
            state.consecutive_failures += 1;
            state.last_error = Some(reason.to_string());
            state.cooldown_until = state.cooldown_until.max(candidate);
            (state.consecutive_failures, state.cooldown_until)
        };
        self.record_status_async(
            name,
            StatusPatch {
                last_error: Some(reason.to_string()),
                consecutive_failures: Some(failures),
                cooldown_until_ms: Some(cooldown_until),
                ..Default::default()
            },
        );
    }

    // Replace the in-memory tokens and write them through. A fresh token
    // re-enables the account.
    pub async fn update_tokens(&self, name: &str, new_tokens: TokenPair) {
        let Some(slot) = self.slot(name) else {
            return;
        };
        if let Err(e) = self
            .store
            .save_tokens(&slot.account_dir, &new_tokens.to_stored())
        {
            warn!("[W-POOL-PERSIST] token_write_failed for {}: {}", name, e);
        }
        let mut state = slot.state.lock().await;
        state.tokens = new_tokens;
        state.consecutive_failures = 0;
        state.last_error = None;
        state.cooldown_until = 0;
    }

    // Return a usable access token, refreshing it first when stale.
    // Refreshes are coalesced per account: one caller holds the refresh
    // lock and performs the exchange; everyone else queued on the lock
    // re-checks freshness and reuses the result.
    pub async fn ensure_access_token(&self, name: &str) -> Result<String, String> {
        let slot = self
            .slot(name)
            .ok_or_else(|| format!("unknown_account: {}", name))?;

        {
            let state = slot.state.lock().await;
            if tokens::is_fresh(state.tokens.details.expires_at, TOKEN_FRESHNESS_BUFFER_SECS) {
                return Ok(state.tokens.access_token.clone());
            }
        }

        let refresh_lock = self
            .refresh_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = refresh_lock.lock().await;

        let current = {
            let state = slot.state.lock().await;
            if tokens::is_fresh(state.tokens.details.expires_at, TOKEN_FRESHNESS_BUFFER_SECS) {
                return Ok(state.tokens.access_token.clone());
            }
            state.tokens.clone()
        };

        debug!("Refreshing stale access token for {}", name);
        let refreshed = self.refresher.refresh(&current).await?;
        let access_token = refreshed.access_token.clone();
        self.update_tokens(name, refreshed).await;
        Ok(access_token)
    }

    #[cfg(test)]
    pub(crate) async fn state_snapshot(&self, name: &str) -> Option<(u32, i64, Option<String>)> {
        let slot = self.slot(name)?;
        let state = slot.state.lock().await;
        Some((
            state.consecutive_failures,
            state.cooldown_until,
            state.last_error.clone(),
        ))
    }

    #[cfg(test)]
    pub(crate) fn sticky_target(&self, session_key: &str) -> Option<String> {
        self.sticky.get(session_key).map(|v| v.clone())
    }
}
