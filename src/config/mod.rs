pub mod cli;
pub mod toml_config;

use crate::adapters::stdio::{
    ServerCommand, DEFAULT_SERVER_PACKAGE, DEFAULT_SERVER_VERSION, DEFAULT_TOKEN_ENV_VAR,
};
use crate::core::session::SessionOptions;
use crate::core::token::{ClientAuthMethod, IdentityConfig};
use crate::core::ConfigProvider;
use crate::domain::model::{Credentials, ReportType, Scope};
use crate::domain::ports::FailurePolicy;
use crate::utils::error::{FetchError, Result};
use crate::utils::validation::{self, Validate};
use chrono::NaiveDate;
use std::time::Duration;
use toml_config::TomlConfig;

pub const DEFAULT_OUTPUT_PREFIX: &str = "xero_data";
pub const DEFAULT_OUTPUT_PATH: &str = "./output";
pub const MAX_CONCURRENT_REQUESTS: usize = 3;

#[cfg(feature = "cli")]
use clap::Parser;

/// Command line flags. Every option is optional so the flags can overlay a
/// TOML file given with `--config`.
#[cfg(feature = "cli")]
#[derive(Clone, Default, Parser)]
#[command(name = "ledger-report-fetch")]
#[command(about = "Fetch raw accounting reports through a JSON-RPC report server")]
pub struct CliConfig {
    #[arg(long, short = 'c', help = "TOML configuration file")]
    pub config: Option<std::path::PathBuf>,

    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long)]
    pub client_secret: Option<String>,

    #[arg(long, value_delimiter = ',', help = "Comma separated scopes")]
    pub scopes: Vec<String>,

    #[arg(long, help = "As-of date (YYYY-MM-DD), defaults to today")]
    pub report_date: Option<String>,

    #[arg(long, value_delimiter = ',', help = "balance_sheet,profit_and_loss,trial_balance")]
    pub reports: Vec<String>,

    #[arg(long)]
    pub tenant: Option<String>,

    #[arg(long)]
    pub output_path: Option<String>,

    #[arg(long)]
    pub output_prefix: Option<String>,

    #[arg(long)]
    pub server_package: Option<String>,

    #[arg(long)]
    pub server_version: Option<String>,

    #[arg(long)]
    pub token_endpoint: Option<String>,

    #[arg(long, help = "form | basic")]
    pub auth_method: Option<String>,

    #[arg(long, help = "continue | abort")]
    pub on_report_failure: Option<String>,

    #[arg(long)]
    pub concurrent_requests: Option<usize>,

    #[arg(long, help = "Handshake timeout in seconds")]
    pub handshake_timeout: Option<u64>,

    #[arg(long, help = "Per-request timeout in seconds")]
    pub request_timeout: Option<u64>,

    #[arg(long, short = 'v', help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[arg(long, help = "List the server's tools and exit")]
    pub list_tools: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    /// 命令列參數覆寫 TOML 設定
    pub fn apply_to(&self, mut toml: TomlConfig) -> Result<TomlConfig> {
        if let Some(client_id) = &self.client_id {
            toml.credentials.client_id = Some(client_id.clone());
        }
        if let Some(client_secret) = &self.client_secret {
            toml.credentials.client_secret = Some(client_secret.clone());
        }
        if !self.scopes.is_empty() {
            toml.credentials.scopes = Some(self.scopes.clone());
        }
        if let Some(endpoint) = &self.token_endpoint {
            toml.identity.token_endpoint = Some(endpoint.clone());
        }
        if let Some(method) = &self.auth_method {
            toml.identity.auth_method = Some(method.parse::<ClientAuthMethod>()?);
        }
        if let Some(package) = &self.server_package {
            toml.server.package = Some(package.clone());
        }
        if let Some(version) = &self.server_version {
            toml.server.version = Some(version.clone());
        }
        if let Some(seconds) = self.handshake_timeout {
            toml.server.handshake_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = self.request_timeout {
            toml.server.request_timeout_seconds = Some(seconds);
        }
        if let Some(date) = &self.report_date {
            toml.reports.date = Some(date.clone());
        }
        if !self.reports.is_empty() {
            toml.reports.types = Some(self.reports.clone());
        }
        if let Some(tenant) = &self.tenant {
            toml.reports.tenant = Some(tenant.clone());
        }
        if let Some(policy) = &self.on_report_failure {
            toml.reports.on_failure = Some(policy.parse::<FailurePolicy>()?);
        }
        if let Some(concurrent) = self.concurrent_requests {
            toml.reports.concurrent_requests = Some(concurrent);
        }
        if let Some(path) = &self.output_path {
            toml.output.path = Some(path.clone());
        }
        if let Some(prefix) = &self.output_prefix {
            toml.output.prefix = Some(prefix.clone());
        }
        Ok(toml)
    }

    /// Loads `--config` (if any), overlays the flags and resolves defaults.
    pub fn resolve(&self) -> Result<RunConfig> {
        let base = match &self.config {
            Some(path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };
        base.validate()?;

        let merged = self.apply_to(base)?;
        let today = chrono::Local::now().date_naive();
        RunConfig::from_toml(&merged, today)
    }
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub credentials: Credentials,
    pub identity: IdentityConfig,
    pub server: ServerCommand,
    pub session: SessionOptions,
    pub report_date: NaiveDate,
    pub reports: Vec<ReportType>,
    pub tenant: Option<String>,
    pub output_path: String,
    pub output_prefix: String,
    pub failure_policy: FailurePolicy,
    pub concurrent_requests: usize,
}

impl RunConfig {
    /// 套用預設值；`today` 是未指定日期時使用的日期
    pub fn from_toml(toml: &TomlConfig, today: NaiveDate) -> Result<Self> {
        let client_id = validation::validate_required_field(
            "credentials.client_id",
            &toml.credentials.client_id,
        )?;
        let client_secret = validation::validate_required_field(
            "credentials.client_secret",
            &toml.credentials.client_secret,
        )?;

        let scopes: Vec<Scope> = match &toml.credentials.scopes {
            Some(names) => names
                .iter()
                .map(|name| name.parse::<Scope>())
                .collect::<Result<_>>()?,
            None => Scope::ALL.to_vec(),
        };
        let credentials = Credentials::new(client_id.as_str(), client_secret.as_str(), scopes)?;

        let mut identity = IdentityConfig::default();
        if let Some(endpoint) = &toml.identity.token_endpoint {
            identity.token_endpoint = endpoint.clone();
        }
        if let Some(method) = toml.identity.auth_method {
            identity.auth_method = method;
        }
        if let Some(user_agent) = &toml.identity.user_agent {
            identity.user_agent = user_agent.clone();
        }
        if let Some(seconds) = toml.identity.timeout_seconds {
            identity.timeout = Duration::from_secs(seconds);
        }

        let mut server = match &toml.server.command {
            Some(program) => ServerCommand {
                program: program.clone(),
                args: toml.server.args.clone().unwrap_or_default(),
                token_env_var: DEFAULT_TOKEN_ENV_VAR.to_string(),
                env: Default::default(),
            },
            None => ServerCommand::npx_package(
                toml.server.package.as_deref().unwrap_or(DEFAULT_SERVER_PACKAGE),
                toml.server.version.as_deref().unwrap_or(DEFAULT_SERVER_VERSION),
            ),
        };
        if let Some(var) = &toml.server.token_env_var {
            server.token_env_var = var.clone();
        }
        if let Some(env) = &toml.server.env {
            server.env = env.clone();
        }

        let mut session = SessionOptions::default();
        if let Some(seconds) = toml.server.handshake_timeout_seconds {
            session.handshake_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = toml.server.request_timeout_seconds {
            session.request_timeout = Duration::from_secs(seconds);
        }

        let report_date = match &toml.reports.date {
            Some(date) => parse_report_date(date)?,
            None => today,
        };

        let mut reports: Vec<ReportType> = Vec::new();
        match &toml.reports.types {
            Some(names) => {
                for name in names {
                    let report_type: ReportType = name.parse()?;
                    if !reports.contains(&report_type) {
                        reports.push(report_type);
                    }
                }
            }
            None => reports.extend(ReportType::ALL),
        }

        let config = Self {
            credentials,
            identity,
            server,
            session,
            report_date,
            reports,
            tenant: toml.reports.tenant.clone().filter(|t| !t.trim().is_empty()),
            output_path: toml
                .output
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string()),
            output_prefix: toml
                .output
                .prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.to_string()),
            failure_policy: toml.reports.on_failure.unwrap_or_default(),
            concurrent_requests: toml.reports.concurrent_requests.unwrap_or(1),
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_report_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        FetchError::InvalidConfigValueError {
            field: "report_date".to_string(),
            value: value.to_string(),
            reason: "Expected YYYY-MM-DD".to_string(),
        }
    })
}

impl Validate for RunConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_url("identity.token_endpoint", &self.identity.token_endpoint)?;
        validation::validate_non_empty_string("server.command", &self.server.program)?;
        validation::validate_non_empty_string("server.token_env_var", &self.server.token_env_var)?;
        validation::validate_path("output.path", &self.output_path)?;
        validation::validate_file_prefix("output.prefix", &self.output_prefix)?;
        validation::validate_range(
            "reports.concurrent_requests",
            self.concurrent_requests,
            1,
            MAX_CONCURRENT_REQUESTS,
        )?;
        validation::validate_range(
            "server.handshake_timeout_seconds",
            self.session.handshake_timeout.as_secs(),
            1,
            600,
        )?;
        validation::validate_range(
            "server.request_timeout_seconds",
            self.session.request_timeout.as_secs(),
            1,
            3600,
        )?;

        if self.reports.is_empty() {
            return Err(FetchError::ConfigValidationError {
                field: "reports.types".to_string(),
                message: "At least one report type is required".to_string(),
            });
        }

        Ok(())
    }
}

impl ConfigProvider for RunConfig {
    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn report_date(&self) -> NaiveDate {
        self.report_date
    }

    fn reports(&self) -> &[ReportType] {
        &self.reports
    }

    fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    fn output_prefix(&self) -> &str {
        &self.output_prefix
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn concurrent_requests(&self) -> usize {
        self.concurrent_requests
    }
}
