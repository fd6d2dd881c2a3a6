use crate::core::token::ClientAuthMethod;
use crate::domain::ports::FailurePolicy;
use crate::utils::error::{FetchError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration file layout. Every key is optional; command line flags are
/// applied on top before the result is resolved into a `RunConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub reports: ReportsSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialsSection {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
}

impl std::fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "****"))
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    pub token_endpoint: Option<String>,
    pub auth_method: Option<ClientAuthMethod>,
    pub user_agent: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    /// npm package of the protocol server
    pub package: Option<String>,
    pub version: Option<String>,
    /// 直接指定執行檔，取代 npx 套件
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub token_env_var: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub handshake_timeout_seconds: Option<u64>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportsSection {
    /// `YYYY-MM-DD`; today when absent
    pub date: Option<String>,
    pub types: Option<Vec<String>>,
    pub tenant: Option<String>,
    pub on_failure: Option<FailurePolicy>,
    pub concurrent_requests: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSection {
    pub path: Option<String>,
    pub prefix: Option<String>,
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| FetchError::ConfigError {
            message: format!(
                "Cannot read config file '{}': {}",
                path.as_ref().display(),
                e
            ),
        })?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FetchError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.identity.token_endpoint {
            validation::validate_url("identity.token_endpoint", endpoint)?;
        }
        if let Some(path) = &self.output.path {
            validation::validate_path("output.path", path)?;
        }
        if let Some(prefix) = &self.output.prefix {
            validation::validate_file_prefix("output.prefix", prefix)?;
        }
        if let Some(concurrent) = self.reports.concurrent_requests {
            validation::validate_range("reports.concurrent_requests", concurrent, 1, 3)?;
        }
        Ok(())
    }
}
