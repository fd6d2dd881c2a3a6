use crate::core::rpc::RpcMessage;
use crate::domain::model::{BearerToken, Credentials, ReportType};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence collaborator for raw report files.
pub trait Storage: Send + Sync {
    /// Writes `data` and returns the location it was written to.
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// 單一報表失敗時的處理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 記錄失敗並繼續其餘報表
    #[default]
    Continue,
    /// 第一個失敗後不再發出新的報表請求
    Abort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = crate::utils::error::FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" | "skip" => Ok(FailurePolicy::Continue),
            "abort" | "stop" => Ok(FailurePolicy::Abort),
            other => Err(crate::utils::error::FetchError::InvalidConfigValueError {
                field: "on_report_failure".to_string(),
                value: other.to_string(),
                reason: "Expected 'continue' or 'abort'".to_string(),
            }),
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn credentials(&self) -> &Credentials;
    fn report_date(&self) -> NaiveDate;
    fn reports(&self) -> &[ReportType];
    fn tenant(&self) -> Option<&str>;
    fn output_prefix(&self) -> &str;
    fn failure_policy(&self) -> FailurePolicy;
    fn concurrent_requests(&self) -> usize;
}

/// Bidirectional message channel to the protocol server.
///
/// `send` and `receive` may be called concurrently from different tasks; a
/// channel serializes writes internally. `receive` returns `Ok(None)` once the
/// peer has closed its side.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: &RpcMessage) -> Result<()>;
    async fn receive(&self) -> Result<Option<RpcMessage>>;
    /// Releases the underlying resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// 附加在傳輸錯誤上的診斷資訊（例如伺服器 stderr 的最後幾行）
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Opens a channel to a protocol server authorised with `token`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &BearerToken) -> Result<Arc<dyn MessageChannel>>;
}
