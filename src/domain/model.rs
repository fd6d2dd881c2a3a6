use crate::utils::error::{FetchError, Result};
use crate::utils::redact::mask_token;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// 身分服務文件規定的 token 有效期（秒）
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "accounting.contacts")]
    Contacts,
    #[serde(rename = "accounting.reports.read")]
    ReportsRead,
    #[serde(rename = "accounting.settings")]
    Settings,
    #[serde(rename = "accounting.transactions")]
    Transactions,
}

impl Scope {
    pub const ALL: [Scope; 4] = [
        Scope::Contacts,
        Scope::ReportsRead,
        Scope::Settings,
        Scope::Transactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Contacts => "accounting.contacts",
            Scope::ReportsRead => "accounting.reports.read",
            Scope::Settings => "accounting.settings",
            Scope::Transactions => "accounting.transactions",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s.trim())
            .ok_or_else(|| FetchError::InvalidConfigValueError {
                field: "scopes".to_string(),
                value: s.to_string(),
                reason: format!(
                    "Unknown scope. Valid scopes: {}",
                    Scope::ALL.map(|scope| scope.as_str()).join(", ")
                ),
            })
    }
}

/// Client credentials for the client-credentials grant. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
    scopes: BTreeSet<Scope>,
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scopes: impl IntoIterator<Item = Scope>,
    ) -> Result<Self> {
        let client_id = client_id.into().trim().to_string();
        let client_secret = client_secret.into().trim().to_string();
        let scopes: BTreeSet<Scope> = scopes.into_iter().collect();

        if client_id.is_empty() {
            return Err(FetchError::MissingConfigError {
                field: "client_id".to_string(),
            });
        }
        if client_secret.is_empty() {
            return Err(FetchError::MissingConfigError {
                field: "client_secret".to_string(),
            });
        }
        if scopes.is_empty() {
            return Err(FetchError::ConfigValidationError {
                field: "scopes".to_string(),
                message: "At least one scope is required".to_string(),
            });
        }

        Ok(Self {
            client_id,
            client_secret,
            scopes,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn scopes(&self) -> &BTreeSet<Scope> {
        &self.scopes
    }

    /// 以空白分隔的 scope 字串，供 token 請求使用
    pub fn scope_param(&self) -> String {
        self.scopes
            .iter()
            .map(Scope::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// A short-lived bearer token. Read-only once issued.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    issued_at: DateTime<Utc>,
    ttl_seconds: i64,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, ttl_seconds: i64) -> Self {
        Self {
            value: value.into(),
            issued_at,
            ttl_seconds,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.ttl_seconds)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn masked(&self) -> String {
        mask_token(&self.value)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &self.masked())
            .field("issued_at", &self.issued_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    BalanceSheet,
    #[serde(alias = "profit_loss")]
    ProfitAndLoss,
    TrialBalance,
}

impl ReportType {
    pub const ALL: [ReportType; 3] = [
        ReportType::BalanceSheet,
        ReportType::ProfitAndLoss,
        ReportType::TrialBalance,
    ];

    /// 伺服器端對應的工具名稱
    pub fn tool_name(&self) -> &'static str {
        match self {
            ReportType::BalanceSheet => "list-report-balance-sheet",
            ReportType::ProfitAndLoss => "list-profit-and-loss",
            ReportType::TrialBalance => "list-trial-balance",
        }
    }

    /// Argument key the tool expects for the as-of date.
    pub fn date_argument(&self) -> &'static str {
        match self {
            ReportType::ProfitAndLoss => "toDate",
            ReportType::BalanceSheet | ReportType::TrialBalance => "date",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            ReportType::BalanceSheet => "balance_sheet",
            ReportType::ProfitAndLoss => "profit_loss",
            ReportType::TrialBalance => "trial_balance",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ReportType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' ' | '&'))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "balancesheet" => Ok(ReportType::BalanceSheet),
            "profitandloss" | "profitloss" | "pnl" | "pl" => Ok(ReportType::ProfitAndLoss),
            "trialbalance" => Ok(ReportType::TrialBalance),
            _ => Err(FetchError::InvalidConfigValueError {
                field: "reports".to_string(),
                value: s.to_string(),
                reason: "Valid reports: balance_sheet, profit_and_loss, trial_balance".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub as_of_date: NaiveDate,
    pub tenant: Option<String>,
}

impl ReportRequest {
    pub fn new(report_type: ReportType, as_of_date: NaiveDate) -> Self {
        Self {
            report_type,
            as_of_date,
            tenant: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// 工具呼叫參數：`{<date key>: "YYYY-MM-DD", tenant?}`
    pub fn arguments(&self) -> serde_json::Value {
        let mut arguments = serde_json::Map::new();
        arguments.insert(
            self.report_type.date_argument().to_string(),
            serde_json::Value::String(self.as_of_date.format("%Y-%m-%d").to_string()),
        );
        if let Some(tenant) = &self.tenant {
            arguments.insert(
                "tenant".to_string(),
                serde_json::Value::String(tenant.clone()),
            );
        }
        serde_json::Value::Object(arguments)
    }
}

/// Raw outcome of one report call. `raw_payload` is the response `result`
/// exactly as received; `response` is the whole envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    pub request: ReportRequest,
    pub raw_payload: serde_json::Value,
    pub response: serde_json::Value,
    pub retrieved_at: DateTime<Utc>,
}

impl ReportResult {
    pub fn file_name(&self, prefix: &str) -> String {
        raw_file_name(prefix, self.request.report_type, self.request.as_of_date)
    }

    /// 工具層級的錯誤旗標（`isError: true`），內容仍原樣保留
    pub fn is_tool_error(&self) -> bool {
        self.raw_payload
            .get("isError")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// 工具錯誤的文字內容，依序串接 `content[].text`
    pub fn tool_error_text(&self) -> Option<String> {
        if !self.is_tool_error() {
            return None;
        }
        let text = self
            .raw_payload
            .get("content")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(serde_json::Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Some(text)
    }
}

pub fn raw_file_name(prefix: &str, report_type: ReportType, date: NaiveDate) -> String {
    format!(
        "{}_{}_{}_raw.json",
        prefix,
        report_type.slug(),
        date.format("%Y%m%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_scope_round_trip_strings() {
        for scope in Scope::ALL {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("accounting.payroll".parse::<Scope>().is_err());
    }

    #[test]
    fn test_credentials_require_id_secret_and_scopes() {
        assert!(Credentials::new("abc", "xyz", [Scope::ReportsRead]).is_ok());
        assert!(matches!(
            Credentials::new("  ", "xyz", [Scope::ReportsRead]),
            Err(FetchError::MissingConfigError { .. })
        ));
        assert!(matches!(
            Credentials::new("abc", "", [Scope::ReportsRead]),
            Err(FetchError::MissingConfigError { .. })
        ));
        assert!(matches!(
            Credentials::new("abc", "xyz", []),
            Err(FetchError::ConfigValidationError { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let credentials = Credentials::new("abc", "super-secret", [Scope::Settings]).unwrap();
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("abc"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_scope_param_is_space_delimited_and_sorted() {
        let credentials = Credentials::new(
            "abc",
            "xyz",
            [Scope::Transactions, Scope::Contacts, Scope::Transactions],
        )
        .unwrap();
        assert_eq!(
            credentials.scope_param(),
            "accounting.contacts accounting.transactions"
        );
    }

    #[test]
    fn test_token_expiry() {
        let issued = Utc.with_ymd_and_hms(2025, 8, 19, 10, 0, 0).unwrap();
        let token = BearerToken::new("tok123", issued, DEFAULT_TOKEN_TTL_SECONDS);

        assert_eq!(token.expires_at() - token.issued_at(), Duration::seconds(1800));
        assert!(!token.is_expired_at(issued + Duration::seconds(1799)));
        assert!(token.is_expired_at(issued + Duration::seconds(1800)));
    }

    #[test]
    fn test_token_debug_is_masked() {
        let token = BearerToken::new(
            "eyJhbGciOiJSUzI1NiIsImtpZCI6IjFDQUY4RTY2",
            Utc::now(),
            DEFAULT_TOKEN_TTL_SECONDS,
        );
        let debug = format!("{:?}", token);
        assert!(!debug.contains("eyJhbGciOiJSUzI1NiIsImtpZCI6IjFDQUY4RTY2"));
        assert!(debug.contains("eyJhbGci..."));
    }

    #[test]
    fn test_report_type_parsing() {
        assert_eq!(
            "balance-sheet".parse::<ReportType>().unwrap(),
            ReportType::BalanceSheet
        );
        assert_eq!(
            "ProfitAndLoss".parse::<ReportType>().unwrap(),
            ReportType::ProfitAndLoss
        );
        assert_eq!(
            "profit_loss".parse::<ReportType>().unwrap(),
            ReportType::ProfitAndLoss
        );
        assert_eq!(
            "trial_balance".parse::<ReportType>().unwrap(),
            ReportType::TrialBalance
        );
        assert!("cash_flow".parse::<ReportType>().is_err());
    }

    #[test]
    fn test_request_arguments_use_tool_date_key() {
        let balance = ReportRequest::new(ReportType::BalanceSheet, date("2025-08-19"));
        assert_eq!(
            balance.arguments(),
            serde_json::json!({"date": "2025-08-19"})
        );

        let pnl = ReportRequest::new(ReportType::ProfitAndLoss, date("2025-08-19"))
            .with_tenant("demo-company");
        assert_eq!(
            pnl.arguments(),
            serde_json::json!({"toDate": "2025-08-19", "tenant": "demo-company"})
        );
    }

    #[test]
    fn test_raw_file_name() {
        assert_eq!(
            raw_file_name("demo_company", ReportType::BalanceSheet, date("2025-08-19")),
            "demo_company_balance_sheet_20250819_raw.json"
        );
        assert_eq!(
            raw_file_name("xero_data", ReportType::ProfitAndLoss, date("2025-01-31")),
            "xero_data_profit_loss_20250131_raw.json"
        );
    }

    #[test]
    fn test_tool_error_flag() {
        let request = ReportRequest::new(ReportType::TrialBalance, date("2025-08-19"));
        let mut result = ReportResult {
            request,
            raw_payload: serde_json::json!({"content": [], "isError": true}),
            response: serde_json::Value::Null,
            retrieved_at: Utc::now(),
        };
        assert!(result.is_tool_error());

        assert_eq!(result.tool_error_text().as_deref(), Some(""));

        result.raw_payload = serde_json::json!({
            "isError": true,
            "content": [{"type": "text", "text": "Unauthorized"}, {"type": "text", "text": "retry"}]
        });
        assert_eq!(result.tool_error_text().as_deref(), Some("Unauthorized\nretry"));

        result.raw_payload = serde_json::json!({"content": []});
        assert!(!result.is_tool_error());
        assert_eq!(result.tool_error_text(), None);
    }
}
