use crate::domain::model::{BearerToken, Credentials, DEFAULT_TOKEN_TTL_SECONDS};
use crate::utils::error::{FetchError, Result};
use crate::utils::redact::redact_secrets;
use chrono::Utc;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://identity.xero.com/connect/token";
pub const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 30;
/// Organisations endpoint used to check that a token is accepted.
pub const DEFAULT_VALIDATION_ENDPOINT: &str = "https://api.xero.com/api.xro/2.0/Organisations";

// 一年，避免異常的 expires_in 造成時間溢位
const MAX_TTL_SECONDS: i64 = 365 * 24 * 3600;
const MAX_ERROR_BODY_CHARS: usize = 200;

/// How the client authenticates itself to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientAuthMethod {
    /// `client_id` / `client_secret` as form fields.
    #[default]
    #[serde(rename = "form")]
    RequestBody,
    /// `Authorization: Basic base64(client_id:client_secret)`.
    #[serde(rename = "basic")]
    BasicHeader,
}

impl std::str::FromStr for ClientAuthMethod {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "form" | "body" => Ok(ClientAuthMethod::RequestBody),
            "basic" => Ok(ClientAuthMethod::BasicHeader),
            other => Err(FetchError::InvalidConfigValueError {
                field: "auth_method".to_string(),
                value: other.to_string(),
                reason: "Expected 'form' or 'basic'".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub token_endpoint: String,
    pub auth_method: ClientAuthMethod,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            auth_method: ClientAuthMethod::default(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(DEFAULT_TOKEN_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges client credentials for a bearer token.
pub struct TokenManager {
    client: Client,
    config: IdentityConfig,
}

impl TokenManager {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config })
    }

    pub fn token_endpoint(&self) -> &str {
        &self.config.token_endpoint
    }

    /// 執行一次 client-credentials 交換，不做重試
    pub async fn acquire_token(&self, credentials: &Credentials) -> Result<BearerToken> {
        let scope = credentials.scope_param();
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];

        let mut request = self
            .client
            .post(&self.config.token_endpoint)
            .header(ACCEPT, "application/json");

        match self.config.auth_method {
            ClientAuthMethod::RequestBody => {
                form.push(("client_id", credentials.client_id()));
                form.push(("client_secret", credentials.client_secret()));
            }
            ClientAuthMethod::BasicHeader => {
                request =
                    request.basic_auth(credentials.client_id(), Some(credentials.client_secret()));
            }
        }

        tracing::info!(
            "🔑 Requesting bearer token from {} (scopes: {})",
            self.config.token_endpoint,
            scope
        );

        let response = request.form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let issued_at = Utc::now();

        tracing::debug!("Token endpoint responded with {}", status);

        if !status.is_success() {
            let parsed: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let code = parsed
                .error
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let description = parsed
                .error_description
                .unwrap_or_else(|| truncate(&body, MAX_ERROR_BODY_CHARS));

            return Err(FetchError::AuthenticationError {
                status: status.as_u16(),
                code: redact_secrets(&code),
                description: redact_secrets(&description),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::MalformedResponseError {
                message: format!("token response is not a JSON object: {}", e),
            })?;

        let access_token = parsed
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| FetchError::MalformedResponseError {
                message: "token response has no access_token".to_string(),
            })?;

        let ttl_seconds = parsed
            .expires_in
            .as_ref()
            .and_then(parse_expires_in)
            .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS);

        let token = BearerToken::new(access_token, issued_at, ttl_seconds);
        tracing::info!(
            "✅ Bearer token acquired: {} (expires at {})",
            token.masked(),
            token.expires_at()
        );

        Ok(token)
    }

    /// Makes one authorised GET against `endpoint`; `true` when it answers 200.
    ///
    /// A rejection is not an error: the token may still be accepted by other
    /// endpoints. Only a failure to reach `endpoint` is returned as `Err`.
    pub async fn validate_token(&self, token: &BearerToken, endpoint: &str) -> Result<bool> {
        tracing::info!("🔍 Validating {} against {}", token.masked(), endpoint);

        let response = self
            .client
            .get(endpoint)
            .bearer_auth(token.value())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            tracing::warn!("⚠️ Validation request answered {}", status);
        }
        Ok(status == reqwest::StatusCode::OK)
    }
}

fn parse_expires_in(value: &serde_json::Value) -> Option<i64> {
    let seconds = match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;

    (seconds > 0).then_some(seconds.min(MAX_TTL_SECONDS))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}
