use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::auth::tokens::TokenPair;

const OPENAI_SESSION: HeaderName = HeaderName::from_static("openai-session");
const X_OPENAI_SESSION: HeaderName = HeaderName::from_static("x-openai-session");
const OPENAI_ACCOUNT_ID: HeaderName = HeaderName::from_static("openai-account-id");
const X_OPENAI_ACCOUNT_ID: HeaderName = HeaderName::from_static("x-openai-account-id");
const OPENAI_USER_ID: HeaderName = HeaderName::from_static("openai-user-id");
const X_OPENAI_USER_ID: HeaderName = HeaderName::from_static("x-openai-user-id");
const OPENAI_ORGANIZATION: HeaderName = HeaderName::from_static("openai-organization");
const OPENAI_ORGANIZATION_ID: HeaderName = HeaderName::from_static("openai-organization-id");

fn set_pair(headers: &mut HeaderMap, names: [HeaderName; 2], value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        for name in names {
            headers.insert(name, value.clone());
        }
    }
}

// Build the forwarded header set. Inbound headers pass through except the
// hop-specific ones; in override-auth mode the client's credentials are
// replaced by the selected account's bearer and identity claims.
pub fn build_forward_headers(
    inbound: &HeaderMap,
    override_auth: bool,
    bearer: Option<&str>,
    tokens: Option<&TokenPair>,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 8);
    for (name, value) in inbound {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        if override_auth && (name == header::AUTHORIZATION || name == header::COOKIE) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if !override_auth {
        return out;
    }

    if let Some(token) = bearer {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            out.insert(header::AUTHORIZATION, value);
        }
    }

    if let Some(tokens) = tokens {
        let details = &tokens.details;
        if let Some(session_id) = details.session_id.as_deref() {
            set_pair(&mut out, [OPENAI_SESSION, X_OPENAI_SESSION], session_id);
        }
        let account_id = details
            .chatgpt_account_id
            .as_deref()
            .or(tokens.account_id.as_deref());
        if let Some(account_id) = account_id {
            set_pair(
                &mut out,
                [OPENAI_ACCOUNT_ID, X_OPENAI_ACCOUNT_ID],
                account_id,
            );
        }
        let user_id = details
            .user_id
            .as_deref()
            .or(details.chatgpt_user_id.as_deref());
        if let Some(user_id) = user_id {
            set_pair(&mut out, [OPENAI_USER_ID, X_OPENAI_USER_ID], user_id);
        }
        if let Some(org) = details.organization_id.as_deref() {
            set_pair(&mut out, [OPENAI_ORGANIZATION, OPENAI_ORGANIZATION_ID], org);
        }
    }

    out
}
