use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::auth::tokens::TokenPair;

const REFRESH_ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

// Exchanges a refresh token for a new access token at the identity
// provider. Does not retry on its own; the router rotates accounts instead.
pub struct OauthRefresher {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
}

impl OauthRefresher {
    pub fn new(token_endpoint: String, client_id: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(60))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create OAuth HTTP client");
        Self {
            client,
            token_endpoint,
            client_id,
        }
    }

    pub async fn refresh(&self, current: &TokenPair) -> Result<TokenPair, String> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| format!("token_refresh_failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(REFRESH_ERROR_BODY_LIMIT).collect();
            return Err(format!("token_refresh_failed: {} {}", status, truncated));
        }

        let parsed = response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| format!("token_refresh_failed: {}", e))?;

        info!("Access token refreshed via {}", self.token_endpoint);

        // Upstream may omit account_id on refresh; keep the one we had.
        let account_id = parsed.account_id.or_else(|| current.account_id.clone());
        Ok(TokenPair::new(
            parsed.access_token,
            parsed.refresh_token,
            parsed.id_token.or_else(|| current.id_token.clone()),
            account_id,
        ))
    }
}
