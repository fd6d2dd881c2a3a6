use crate::core::rpc::{decode_line, encode_line, RpcMessage};
use crate::domain::model::BearerToken;
use crate::domain::ports::{Connector, MessageChannel};
use crate::utils::error::{FetchError, Result};
use crate::utils::redact::redact_secrets;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

pub const DEFAULT_SERVER_PACKAGE: &str = "@xeroapi/xero-mcp-server";
pub const DEFAULT_SERVER_VERSION: &str = "latest";
pub const DEFAULT_TOKEN_ENV_VAR: &str = "XERO_CLIENT_BEARER_TOKEN";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 20;

/// 啟動協定伺服器子行程所需的指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Environment variable the bearer token is handed over in.
    pub token_env_var: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServerCommand {
    /// `npx -y <package>@<version>`
    pub fn npx_package(package: &str, version: &str) -> Self {
        let program = if cfg!(windows) { "npx.cmd" } else { "npx" };
        Self {
            program: program.to_string(),
            args: vec!["-y".to_string(), format!("{}@{}", package, version)],
            token_env_var: DEFAULT_TOKEN_ENV_VAR.to_string(),
            env: BTreeMap::new(),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns the protocol server as a child process and talks to it over stdio.
pub struct StdioConnector {
    command: ServerCommand,
}

impl StdioConnector {
    pub fn new(command: ServerCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, token: &BearerToken) -> Result<Arc<dyn MessageChannel>> {
        tracing::info!("🚀 Starting protocol server: {}", self.command.display());

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(&self.command.token_env_var, token.value())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::TransportUnavailableError {
                message: format!("failed to spawn '{}': {}", self.command.program, e),
            })?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    return Err(FetchError::TransportUnavailableError {
                        message: "child process stdio was not captured".to_string(),
                    })
                }
            };

        if let Some(pid) = child.id() {
            tracing::debug!("Protocol server running with pid {}", pid);
        }

        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = redact_secrets(&line);
                tracing::debug!("[server] {}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        Ok(Arc::new(StdioChannel {
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            child: Mutex::new(Some(child)),
            stderr_tail,
        }))
    }
}

pub struct StdioChannel {
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[async_trait]
impl MessageChannel for StdioChannel {
    async fn send(&self, message: &RpcMessage) -> Result<()> {
        let line = encode_line(message)?;
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or_else(|| FetchError::TransportError {
            message: "server stdin already closed".to_string(),
        })?;

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        write.await.map_err(|e| FetchError::TransportError {
            message: format!("failed to write to server: {}", e),
        })
    }

    async fn receive(&self) -> Result<Option<RpcMessage>> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let line = stdout
                .next_line()
                .await
                .map_err(|e| FetchError::TransportError {
                    message: format!("failed to read from server: {}", e),
                })?;

            match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line).map(Some),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // 關閉 stdin 讓伺服器自行結束
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Protocol server exited with {}", status);
            }
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Failed to wait for protocol server: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    "⚠️ Protocol server did not exit within {}s, killing it",
                    SHUTDOWN_GRACE.as_secs()
                );
                child.kill().await?;
            }
        }

        Ok(())
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}
