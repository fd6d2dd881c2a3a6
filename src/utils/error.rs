use crate::domain::model::ReportType;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Authentication failed (HTTP {status}): {code} - {description}")]
    AuthenticationError {
        status: u16,
        code: String,
        description: String,
    },

    #[error("Bearer token expired at {expired_at}")]
    ExpiredTokenError { expired_at: DateTime<Utc> },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Protocol server unavailable: {message}")]
    TransportUnavailableError { message: String },

    #[error("Transport failure: {message}")]
    TransportError { message: String },

    #[error("{report_type} request rejected by server (code {code}): {message}")]
    ReportFetchError {
        report_type: ReportType,
        code: i64,
        message: String,
    },

    #[error("{report_type} request rejected as unauthorized: {message}")]
    UpstreamAuthenticationError {
        report_type: ReportType,
        message: String,
    },

    #[error("Server error for '{method}' (code {code}): {message}")]
    ServerError {
        method: String,
        code: i64,
        message: String,
    },

    #[error("'{operation}' timed out after {}s", timeout.as_secs_f64())]
    RequestTimeoutError { operation: String, timeout: Duration },

    #[error("Malformed response: {message}")]
    MalformedResponseError { message: String },

    #[error("Failed to persist '{path}': {source}")]
    PersistenceError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid configuration for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Network,
    Transport,
    Upstream,
    Timeout,
    Data,
    Persistence,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationError { .. }
            | Self::ExpiredTokenError { .. }
            | Self::UpstreamAuthenticationError { .. } => {
                ErrorCategory::Authentication
            }
            Self::NetworkError(_) => ErrorCategory::Network,
            Self::TransportUnavailableError { .. } | Self::TransportError { .. } => {
                ErrorCategory::Transport
            }
            Self::ReportFetchError { .. } | Self::ServerError { .. } => ErrorCategory::Upstream,
            Self::RequestTimeoutError { .. } => ErrorCategory::Timeout,
            Self::MalformedResponseError { .. } | Self::SerializationError(_) => {
                ErrorCategory::Data
            }
            Self::PersistenceError { .. } | Self::IoError(_) => ErrorCategory::Persistence,
            Self::ConfigError { .. }
            | Self::ConfigValidationError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. } => ErrorCategory::Configuration,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            // 可重試的暫時性錯誤
            ErrorCategory::Network | ErrorCategory::Timeout => ErrorSeverity::Medium,
            ErrorCategory::Authentication
            | ErrorCategory::Upstream
            | ErrorCategory::Data
            | ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::Transport | ErrorCategory::Persistence => ErrorSeverity::Critical,
        }
    }

    /// 是否值得由呼叫端重試（本 crate 內部從不重試）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::RequestTimeoutError { .. }
                | Self::TransportUnavailableError { .. }
        )
    }

    /// 之後的報表請求也會被拒絕，不論失敗策略都停止送出
    pub fn halts_run(&self) -> bool {
        matches!(
            self,
            Self::UpstreamAuthenticationError { .. } | Self::ExpiredTokenError { .. }
        )
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::AuthenticationError { status, code, .. } => format!(
                "The identity service rejected the client credentials (HTTP {status}, {code})"
            ),
            Self::ExpiredTokenError { expired_at } => {
                format!("The bearer token expired at {expired_at}; acquire a new one")
            }
            Self::NetworkError(_) => "Could not reach the identity service".to_string(),
            Self::TransportUnavailableError { .. } => {
                "The report server could not be started or did not answer the handshake"
                    .to_string()
            }
            Self::TransportError { .. } => {
                "The connection to the report server was lost".to_string()
            }
            Self::ReportFetchError {
                report_type,
                message,
                ..
            } => format!("The server refused the {report_type} report: {message}"),
            Self::UpstreamAuthenticationError { report_type, .. } => format!(
                "The report server rejected the bearer token while fetching {report_type}"
            ),
            Self::RequestTimeoutError { operation, timeout } => format!(
                "No answer for '{operation}' within {}s",
                timeout.as_secs()
            ),
            Self::PersistenceError { path, .. } => format!("Could not write '{path}'"),
            _ => self.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::AuthenticationError { .. } => {
                "Check the client id/secret and that the app is enabled for client credentials with the requested scopes"
            }
            Self::ExpiredTokenError { .. } => "Run again to acquire a fresh token",
            Self::UpstreamAuthenticationError { .. } => {
                "Check that the app is connected to the organisation and granted the report scopes"
            }
            Self::NetworkError(_) => "Check network connectivity, proxies and TLS interception",
            Self::TransportUnavailableError { .. } => {
                "Make sure Node.js/npx is installed and the server package version exists"
            }
            Self::TransportError { .. } => "Inspect the server stderr in the logs and re-run",
            Self::ReportFetchError { .. } | Self::ServerError { .. } => {
                "Verify the token scopes include accounting.reports.read and the tenant is connected"
            }
            Self::RequestTimeoutError { .. } => "Increase the request timeout or retry later",
            Self::MalformedResponseError { .. } | Self::SerializationError(_) => {
                "The upstream service returned unexpected data; retry or check its status"
            }
            Self::PersistenceError { .. } | Self::IoError(_) => {
                "Check that the output directory exists and is writable"
            }
            Self::ConfigError { .. }
            | Self::ConfigValidationError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. } => "Fix the configuration file or command line flags",
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

// 伺服器以文字回報的授權失敗
const AUTH_FAILURE_INDICATORS: &[&str] = &[
    "status code 401",
    "status code 403",
    "unauthorized",
    "forbidden",
    "authentication failed",
    "invalid token",
    "token expired",
    "access denied",
];

/// Whether an upstream error text says the token was rejected.
pub fn indicates_auth_failure(text: &str) -> bool {
    let text = text.to_lowercase();
    AUTH_FAILURE_INDICATORS
        .iter()
        .any(|indicator| text.contains(indicator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_by_category() {
        let timeout = FetchError::RequestTimeoutError {
            operation: "balance_sheet".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert_eq!(timeout.severity(), ErrorSeverity::Medium);
        assert!(timeout.is_retryable());

        let transport = FetchError::TransportError {
            message: "broken pipe".to_string(),
        };
        assert_eq!(transport.severity(), ErrorSeverity::Critical);
        assert!(!transport.is_retryable());
    }

    #[test]
    fn test_report_fetch_error_names_report() {
        let err = FetchError::ReportFetchError {
            report_type: ReportType::TrialBalance,
            code: -32000,
            message: "insufficient scope".to_string(),
        };
        assert!(err.to_string().contains("trial_balance"));
        assert!(err.to_string().contains("-32000"));
    }

    #[test]
    fn test_auth_failure_indicators() {
        assert!(indicates_auth_failure("Request failed with status code 401"));
        assert!(indicates_auth_failure("AuthenticationUnsuccessful: Unauthorized"));
        assert!(indicates_auth_failure("Token expired at 10:00"));
        assert!(!indicates_auth_failure("insufficient scope"));
        assert!(!indicates_auth_failure("tenant not found"));
    }

    #[test]
    fn test_upstream_auth_failure_halts_the_run() {
        let err = FetchError::UpstreamAuthenticationError {
            report_type: ReportType::BalanceSheet,
            message: "forbidden".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.severity(), ErrorSeverity::High);
        assert!(err.halts_run());

        let scope = FetchError::ReportFetchError {
            report_type: ReportType::BalanceSheet,
            code: -32000,
            message: "insufficient scope".to_string(),
        };
        assert!(!scope.halts_run());
    }

    #[test]
    fn test_timeout_message_reports_seconds() {
        let err = FetchError::RequestTimeoutError {
            operation: "tools/call".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "'tools/call' timed out after 1.5s");
    }
}
