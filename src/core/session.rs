use crate::core::rpc::{
    initialize_params, tool_call_params, RpcMessage, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::domain::model::{BearerToken, ReportRequest, ReportResult};
use crate::domain::ports::{Connector, MessageChannel};
use crate::utils::error::{indicates_auth_failure, FetchError, Result};
use crate::utils::redact::redact_secrets;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

// initialize 固定使用 id 0，報表請求從 1 開始
const HANDSHAKE_REQUEST_ID: u64 = 0;
const FIRST_REQUEST_ID: u64 = 1;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;

#[derive(Default)]
struct SessionState {
    /// First fatal transport failure; once set the session never recovers.
    failure: OnceLock<String>,
    closed: AtomicBool,
}

/// An open conversation with one protocol server.
///
/// Requests are multiplexed over the shared channel by id: a dispatcher task
/// owns the read side and hands every response to the caller waiting on that
/// id, so concurrent `fetch_report` calls never see each other's answers.
pub struct Session {
    channel: Arc<dyn MessageChannel>,
    token: BearerToken,
    next_id: AtomicU64,
    pending: PendingMap,
    state: Arc<SessionState>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl Session {
    fn start(channel: Arc<dyn MessageChannel>, token: BearerToken, request_timeout: Duration) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(SessionState::default());

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&channel),
            Arc::clone(&pending),
            Arc::clone(&state),
        ));

        Self {
            channel,
            token,
            next_id: AtomicU64::new(FIRST_REQUEST_ID),
            pending,
            state,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
            request_timeout,
        }
    }

    /// 尚未關閉、沒有傳輸錯誤，且 token 未過期
    pub fn is_valid(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
            && self.state.failure.get().is_none()
            && !self.token.is_expired()
    }

    async fn handshake(&self, options: &SessionOptions) -> Result<()> {
        let params = initialize_params(&options.client_name, &options.client_version);
        let response = self
            .call(
                HANDSHAKE_REQUEST_ID,
                METHOD_INITIALIZE,
                params,
                options.handshake_timeout,
                METHOD_INITIALIZE,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(FetchError::TransportUnavailableError {
                message: format!(
                    "server rejected initialize (code {}): {}",
                    error.code,
                    redact_secrets(&error.message)
                ),
            });
        }

        if let Some(server) = response
            .result
            .as_ref()
            .and_then(|result| result.get("serverInfo"))
        {
            tracing::debug!("Server info: {}", server);
        }

        self.channel
            .send(&RpcMessage::notification(METHOD_INITIALIZED, None))
            .await
            .map_err(|e| self.invalidate(e))
    }

    pub async fn fetch_report(&self, request: &ReportRequest) -> Result<ReportResult> {
        if self.token.is_expired() {
            return Err(FetchError::ExpiredTokenError {
                expired_at: self.token.expires_at(),
            });
        }

        let report_type = request.report_type;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = tool_call_params(report_type.tool_name(), request.arguments());

        tracing::info!(
            "📊 Requesting {} as of {} (request id {})",
            report_type,
            request.as_of_date,
            id
        );

        let response = self
            .call(
                id,
                METHOD_TOOLS_CALL,
                params,
                self.request_timeout,
                report_type.slug(),
            )
            .await?;

        if let Some(error) = &response.error {
            let message = redact_secrets(&error.message);
            if indicates_auth_failure(&message) {
                return Err(FetchError::UpstreamAuthenticationError {
                    report_type,
                    message,
                });
            }
            return Err(FetchError::ReportFetchError {
                report_type,
                code: error.code,
                message,
            });
        }

        let raw_payload =
            response
                .result
                .clone()
                .ok_or_else(|| FetchError::MalformedResponseError {
                    message: format!("response to {} request carries no result", report_type),
                })?;

        Ok(ReportResult {
            request: request.clone(),
            raw_payload,
            response: response.to_value()?,
            retrieved_at: Utc::now(),
        })
    }

    /// Asks the server which tools it offers.
    pub async fn list_tools(&self) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .call(
                id,
                METHOD_TOOLS_LIST,
                serde_json::json!({}),
                self.request_timeout,
                METHOD_TOOLS_LIST,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(FetchError::ServerError {
                method: METHOD_TOOLS_LIST.to_string(),
                code: error.code,
                message: redact_secrets(&error.message),
            });
        }

        response
            .result
            .ok_or_else(|| FetchError::MalformedResponseError {
                message: "tools/list response carries no result".to_string(),
            })
    }

    async fn call(
        &self,
        id: u64,
        method: &str,
        params: Value,
        timeout: Duration,
        operation: &str,
    ) -> Result<RpcMessage> {
        self.ensure_usable()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // dispatcher 先設定 failure 再清空 pending；這裡反過來檢查，兩邊不會漏掉
        if let Some(reason) = self.state.failure.get() {
            self.pending.lock().await.remove(&id);
            return Err(FetchError::TransportError {
                message: reason.clone(),
            });
        }

        if let Err(e) = self
            .channel
            .send(&RpcMessage::request(id, method, params))
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(self.invalidate(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(FetchError::TransportError {
                message: self
                    .state
                    .failure
                    .get()
                    .cloned()
                    .unwrap_or_else(|| "connection to server lost".to_string()),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(
                    "⏱️ No response to '{}' (request id {}) within {}s",
                    operation,
                    id,
                    timeout.as_secs_f64()
                );
                Err(FetchError::RequestTimeoutError {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(FetchError::TransportError {
                message: "session is closed".to_string(),
            });
        }
        if let Some(reason) = self.state.failure.get() {
            return Err(FetchError::TransportError {
                message: reason.clone(),
            });
        }
        Ok(())
    }

    /// Marks the session unusable after a write failure.
    fn invalidate(&self, error: FetchError) -> FetchError {
        let reason = redact_secrets(&error.to_string());
        let _ = self.state.failure.set(reason.clone());
        FetchError::TransportError { message: reason }
    }

    /// Releases the channel. Safe to call repeatedly and after a failure.
    pub async fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!("Closing protocol session");
        let _ = self.state.failure.set("session is closed".to_string());
        self.pending.lock().await.clear();

        let result = self.channel.close().await;
        if let Some(handle) = self.take_dispatcher() {
            handle.abort();
        }
        result
    }

    fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.dispatcher.lock().ok().and_then(|mut handle| handle.take())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.take_dispatcher() {
            handle.abort();
        }
    }
}

async fn dispatch(channel: Arc<dyn MessageChannel>, pending: PendingMap, state: Arc<SessionState>) {
    let reason = loop {
        let message = match channel.receive().await {
            Ok(Some(message)) => message,
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break redact_secrets(&e.to_string()),
        };

        if let Some(id) = message.response_id() {
            let waiter = pending.lock().await.remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => tracing::warn!(
                    "⚠️ Discarding response for unknown or expired request id {}",
                    id
                ),
            }
        } else if let Some(id) = message.request_id() {
            let method = message.method.as_deref().unwrap_or_default();
            let reply = if method == "ping" {
                RpcMessage::success(id, serde_json::json!({}))
            } else {
                tracing::debug!("Rejecting server request '{}'", method);
                RpcMessage::failure(id, METHOD_NOT_FOUND, "Method not found")
            };
            if let Err(e) = channel.send(&reply).await {
                break redact_secrets(&e.to_string());
            }
        } else if let Some(method) = &message.method {
            tracing::debug!("Server notification: {}", method);
        } else {
            tracing::warn!("⚠️ Ignoring message without a usable id: {:?}", message.id);
        }
    };

    let reason = match channel.diagnostics() {
        Some(stderr) => format!("{}; server stderr:\n{}", reason, stderr),
        None => reason,
    };

    if !state.closed.load(Ordering::SeqCst) {
        tracing::warn!("❌ Protocol session lost: {}", reason);
    }

    let _ = state.failure.set(reason);
    pending.lock().await.clear();
}

/// Opens sessions on a [`Connector`] and issues report requests on them.
pub struct ReportClient<C: Connector> {
    connector: C,
    options: SessionOptions,
}

impl<C: Connector> ReportClient<C> {
    pub fn new(connector: C, options: SessionOptions) -> Self {
        Self { connector, options }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub async fn open_session(&self, token: &BearerToken) -> Result<Session> {
        // 過期的 token 不配置任何傳輸資源
        if token.is_expired() {
            return Err(FetchError::ExpiredTokenError {
                expired_at: token.expires_at(),
            });
        }

        let timeout = self.options.handshake_timeout;
        let opened = tokio::time::timeout(timeout, self.connect_and_handshake(token)).await;

        match opened {
            Ok(Ok(session)) => {
                tracing::info!("🤝 Protocol session established");
                Ok(session)
            }
            Ok(Err(e @ FetchError::TransportUnavailableError { .. })) => Err(e),
            Ok(Err(e)) => Err(FetchError::TransportUnavailableError {
                message: format!("handshake failed: {}", e),
            }),
            Err(_) => Err(FetchError::TransportUnavailableError {
                message: format!("handshake did not complete within {}s", timeout.as_secs()),
            }),
        }
    }

    async fn connect_and_handshake(&self, token: &BearerToken) -> Result<Session> {
        let channel = self.connector.connect(token).await?;
        let session = Session::start(channel, token.clone(), self.options.request_timeout);

        if let Err(e) = session.handshake(&self.options).await {
            let _ = session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    pub async fn fetch_report(
        &self,
        session: &Session,
        request: &ReportRequest,
    ) -> Result<ReportResult> {
        session.fetch_report(request).await
    }

    pub async fn close_session(&self, session: &Session) -> Result<()> {
        session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::memory_connector;
    use crate::domain::model::ReportType;
    use chrono::NaiveDate;

    fn token() -> BearerToken {
        BearerToken::new("tok123", Utc::now(), 1800)
    }

    #[tokio::test]
    async fn test_handshake_uses_id_zero_then_notifies() {
        let (connector, mut server) = memory_connector();
        let client = ReportClient::new(connector, SessionOptions::default());

        let server_task = tokio::spawn(async move {
            let initialize = server.complete_handshake().await.unwrap();
            let initialized = server.next_message().await.unwrap();
            (initialize, initialized, server)
        });

        let session = client.open_session(&token()).await.unwrap();
        let (initialize, initialized, _server) = server_task.await.unwrap();

        assert_eq!(initialize.request_id(), Some(0));
        assert_eq!(
            initialize.params.as_ref().unwrap()["protocolVersion"],
            "2024-11-05"
        );
        assert_eq!(initialized.method.as_deref(), Some(METHOD_INITIALIZED));
        assert!(initialized.id.is_none());
        assert!(session.is_valid());
        assert_eq!(client.connector().injected_token().await.as_deref(), Some("tok123"));
    }

    #[tokio::test]
    async fn test_tool_call_shape() {
        let (connector, mut server) = memory_connector();
        let client = ReportClient::new(connector, SessionOptions::default());

        let server_task = tokio::spawn(async move {
            server.complete_handshake().await.unwrap();
            let request = server.next_request().await.unwrap();
            let id = request.request_id().unwrap();
            server.reply_result(id, serde_json::json!({"content": []}));
            (request, server)
        });

        let session = client.open_session(&token()).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 8, 19).unwrap();
        let request = ReportRequest::new(ReportType::ProfitAndLoss, date).with_tenant("t-1");
        client.fetch_report(&session, &request).await.unwrap();

        let (sent, _server) = server_task.await.unwrap();
        assert_eq!(sent.request_id(), Some(1));
        assert_eq!(sent.method.as_deref(), Some("tools/call"));
        assert_eq!(
            sent.params.unwrap(),
            serde_json::json!({
                "name": "list-profit-and-loss",
                "arguments": {"toDate": "2025-08-19", "tenant": "t-1"}
            })
        );
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (connector, mut server) = memory_connector();
        let client = ReportClient::new(connector, SessionOptions::default());

        let server_task = tokio::spawn(async move {
            server.complete_handshake().await.unwrap();
            server.reply(RpcMessage::request(99, "ping", serde_json::json!({})));
            loop {
                let message = server.next_message().await.unwrap();
                if message.response_id() == Some(99) {
                    return message;
                }
            }
        });

        let _session = client.open_session(&token()).await.unwrap();
        let pong = server_task.await.unwrap();
        assert_eq!(pong.result, Some(serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_list_tools_error_is_server_error() {
        let (connector, mut server) = memory_connector();
        let client = ReportClient::new(connector, SessionOptions::default());

        let server_task = tokio::spawn(async move {
            server.complete_handshake().await.unwrap();
            let request = server.next_request().await.unwrap();
            server.reply_error(request.request_id().unwrap(), -32601, "Method not found");
            server
        });

        let session = client.open_session(&token()).await.unwrap();
        let err = session.list_tools().await.unwrap_err();
        let _server = server_task.await.unwrap();

        assert!(matches!(
            err,
            FetchError::ServerError { code: -32601, ref method, .. } if method == "tools/list"
        ));
        assert!(session.is_valid());
    }

    #[tokio::test]
    async fn test_handshake_error_is_transport_unavailable() {
        let (connector, mut server) = memory_connector();
        let client = ReportClient::new(connector, SessionOptions::default());

        let server_task = tokio::spawn(async move {
            let request = server.next_request().await.unwrap();
            server.reply_error(request.request_id().unwrap(), -32603, "boom");
            server
        });

        let err = client.open_session(&token()).await.err().unwrap();
        let _server = server_task.await.unwrap();
        assert!(matches!(err, FetchError::TransportUnavailableError { .. }));
    }
}
