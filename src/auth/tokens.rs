use base64::Engine as _;
use serde::Deserialize;

use crate::store::StoredTokens;

// Identity claims derived from the token text. Pure byproducts of parsing;
// never persisted on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenDetails {
    pub expires_at: Option<i64>, // ms since epoch
    pub session_id: Option<String>,
    pub chatgpt_account_id: Option<String>,
    pub chatgpt_user_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: Option<String>,
    pub account_id: Option<String>,
    pub details: TokenDetails,
}

impl TokenPair {
    pub fn new(
        access_token: String,
        refresh_token: String,
        id_token: Option<String>,
        account_id: Option<String>,
    ) -> Self {
        let details = derive(&access_token, id_token.as_deref());
        Self {
            access_token,
            refresh_token,
            id_token,
            account_id,
            details,
        }
    }

    pub fn from_stored(stored: StoredTokens) -> Self {
        Self::new(
            stored.access_token,
            stored.refresh_token,
            stored.id_token,
            stored.account_id,
        )
    }

    pub fn to_stored(&self) -> StoredTokens {
        StoredTokens {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            id_token: self.id_token.clone(),
            account_id: self.account_id.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawClaims {
    #[serde(default)]
    exp: Option<serde_json::Number>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    sid: Option<String>,
    #[serde(rename = "https://api.openai.com/auth", default)]
    auth: RawAuthClaims,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthClaims {
    #[serde(default)]
    chatgpt_account_id: Option<String>,
    #[serde(default)]
    chatgpt_user_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    organizations: Vec<RawOrganization>,
}

#[derive(Debug, Deserialize)]
struct RawOrganization {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    is_default: bool,
}

// Decode the payload segment of a JWT-shaped token. Signature is not
// verified: these tokens come from our own store and the claims are only
// used to label outbound requests.
fn decode_claims(token: &str) -> Option<RawClaims> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl RawClaims {
    fn expires_at_ms(&self) -> Option<i64> {
        let exp = self.exp.as_ref()?;
        if let Some(secs) = exp.as_i64() {
            return Some(secs * 1000);
        }
        exp.as_f64().map(|secs| (secs * 1000.0) as i64)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone().or_else(|| self.sid.clone())
    }

    fn organization_id(&self) -> Option<String> {
        let orgs = &self.auth.organizations;
        orgs.iter()
            .find(|o| o.is_default)
            .or_else(|| orgs.first())
            .and_then(|o| o.id.clone())
    }
}

// Derive identity claims from the access token, filling any gaps from the
// id token. All parse failures are silent: a claim that cannot be read is
// simply unset.
pub fn derive(access_token: &str, id_token: Option<&str>) -> TokenDetails {
    let mut details = TokenDetails::default();
    let sources = [Some(access_token), id_token];
    for token in sources.into_iter().flatten() {
        let Some(claims) = decode_claims(token) else {
            continue;
        };
        if details.expires_at.is_none() {
            details.expires_at = claims.expires_at_ms();
        }
        if details.session_id.is_none() {
            details.session_id = claims.session_id();
        }
        if details.chatgpt_account_id.is_none() {
            details.chatgpt_account_id = claims.auth.chatgpt_account_id.clone();
        }
        if details.chatgpt_user_id.is_none() {
            details.chatgpt_user_id = claims.auth.chatgpt_user_id.clone();
        }
        if details.user_id.is_none() {
            details.user_id = claims.auth.user_id.clone();
        }
        if details.organization_id.is_none() {
            details.organization_id = claims.organization_id();
        }
    }
    details
}

pub fn expiry(token: &str) -> Option<i64> {
    decode_claims(token)?.expires_at_ms()
}

pub fn session_id(token: &str) -> Option<String> {
    decode_claims(token)?.session_id()
}

// A token with no readable expiry is assumed usable; the upstream will
// reject it if not.
pub fn is_fresh(expires_at: Option<i64>, buffer_s: i64) -> bool {
    match expires_at {
        Some(at) => at - chrono::Utc::now().timestamp_millis() > buffer_s * 1000,
        None => true,
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(payload: &serde_json::Value) -> String {
    let b64 = |bytes: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    format!(
        "{}.{}.{}",
        b64(br#"{"alg":"RS256","typ":"JWT"}"#),
        b64(payload.to_string().as_bytes()),
        b64(b"sig")
    )
}
