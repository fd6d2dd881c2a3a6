//! In-process transport: the client half implements [`MessageChannel`], the
//! server half is driven by tests to script replies, reorder them, withhold
//! them or break the connection.

use crate::core::rpc::{RpcMessage, METHOD_INITIALIZE, PROTOCOL_VERSION};
use crate::domain::model::BearerToken;
use crate::domain::ports::{Connector, MessageChannel};
use crate::utils::error::{FetchError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub fn memory_channel() -> (MemoryChannel, MemoryServer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let channel = MemoryChannel {
        outbound: Mutex::new(Some(request_tx)),
        inbound: Mutex::new(response_rx),
    };
    let server = MemoryServer {
        requests: request_rx,
        responses: response_tx,
    };

    (channel, server)
}

pub struct MemoryChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<RpcMessage>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<RpcMessage>>>,
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&self, message: &RpcMessage) -> Result<()> {
        let outbound = self.outbound.lock().await;
        let sender = outbound.as_ref().ok_or_else(|| FetchError::TransportError {
            message: "channel already closed".to_string(),
        })?;

        sender
            .send(message.clone())
            .map_err(|_| FetchError::TransportError {
                message: "broken pipe: server side is gone".to_string(),
            })
    }

    async fn receive(&self) -> Result<Option<RpcMessage>> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.outbound.lock().await.take();
        Ok(())
    }
}

pub struct MemoryServer {
    requests: mpsc::UnboundedReceiver<RpcMessage>,
    responses: mpsc::UnboundedSender<Result<RpcMessage>>,
}

impl MemoryServer {
    /// Next message of any kind; `None` once the client closed the channel.
    pub async fn next_message(&mut self) -> Option<RpcMessage> {
        self.requests.recv().await
    }

    /// 下一個帶 id 的請求（略過 notification）
    pub async fn next_request(&mut self) -> Option<RpcMessage> {
        loop {
            let message = self.requests.recv().await?;
            if message.request_id().is_some() {
                return Some(message);
            }
        }
    }

    pub fn reply(&self, message: RpcMessage) -> bool {
        self.responses.send(Ok(message)).is_ok()
    }

    pub fn reply_result(&self, id: u64, result: Value) -> bool {
        self.reply(RpcMessage::success(id, result))
    }

    pub fn reply_error(&self, id: u64, code: i64, message: &str) -> bool {
        self.reply(RpcMessage::failure(id, code, message))
    }

    /// Simulates a framing failure on the read side.
    pub fn inject_fault(&self, message: &str) -> bool {
        self.responses
            .send(Err(FetchError::TransportError {
                message: message.to_string(),
            }))
            .is_ok()
    }

    /// Waits for `initialize` and answers it the way a real server would.
    pub async fn complete_handshake(&mut self) -> Option<RpcMessage> {
        let request = self.next_request().await?;
        if request.method.as_deref() != Some(METHOD_INITIALIZE) {
            return None;
        }
        let id = request.request_id()?;
        self.reply_result(
            id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "memory-server", "version": "0.0.0"}
            }),
        );
        Some(request)
    }

    /// Drops both directions, as if the server process died.
    pub fn hang_up(self) {}
}

/// Hands out one pre-built [`MemoryChannel`] and records what it was given.
pub struct MemoryConnector {
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    connects: AtomicUsize,
    injected_token: Mutex<Option<String>>,
}

impl MemoryConnector {
    pub fn new(channel: MemoryChannel) -> Self {
        Self {
            channel: Mutex::new(Some(Arc::new(channel))),
            connects: AtomicUsize::new(0),
            injected_token: Mutex::new(None),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn injected_token(&self) -> Option<String> {
        self.injected_token.lock().await.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, token: &BearerToken) -> Result<Arc<dyn MessageChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.injected_token.lock().await = Some(token.value().to_string());

        let channel = self.channel.lock().await.take().ok_or_else(|| {
            FetchError::TransportUnavailableError {
                message: "memory channel already handed out".to_string(),
            }
        })?;

        Ok(channel)
    }
}

pub fn memory_connector() -> (MemoryConnector, MemoryServer) {
    let (channel, server) = memory_channel();
    (MemoryConnector::new(channel), server)
}
