use crate::core::session::{ReportClient, Session};
use crate::core::token::TokenManager;
use crate::domain::model::{ReportRequest, ReportType};
use crate::domain::ports::{ConfigProvider, Connector, FailurePolicy, Storage};
use crate::utils::error::{indicates_auth_failure, FetchError, Result};
use crate::utils::redact::redact_secrets;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug)]
pub enum ReportStatus {
    Saved { path: String },
    Failed { error: FetchError },
    /// 因 abort 策略或授權失敗而未送出
    Skipped,
}

#[derive(Debug)]
pub struct ReportOutcome {
    pub report_type: ReportType,
    pub status: ReportStatus,
}

/// Per-report results of one run, in the order the reports were requested.
#[derive(Debug)]
pub struct RunSummary {
    pub report_date: NaiveDate,
    pub outcomes: Vec<ReportOutcome>,
}

impl RunSummary {
    pub fn files_saved(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match &outcome.status {
                ReportStatus::Saved { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(ReportType, &FetchError)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match &outcome.status {
                ReportStatus::Failed { error } => Some((outcome.report_type, error)),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<ReportType> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, ReportStatus::Skipped))
            .map(|outcome| outcome.report_type)
            .collect()
    }

    /// 全部報表都已取得並寫入
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| matches!(outcome.status, ReportStatus::Saved { .. }))
    }
}

/// Drives one run: token, session, every configured report, persistence.
pub struct ReportEngine<S, C, P>
where
    S: Storage + Clone + 'static,
    C: Connector,
    P: ConfigProvider,
{
    token_manager: TokenManager,
    client: ReportClient<C>,
    storage: S,
    config: P,
}

impl<S, C, P> ReportEngine<S, C, P>
where
    S: Storage + Clone + 'static,
    C: Connector,
    P: ConfigProvider,
{
    pub fn new(token_manager: TokenManager, client: ReportClient<C>, storage: S, config: P) -> Self {
        Self {
            token_manager,
            client,
            storage,
            config,
        }
    }

    pub fn client(&self) -> &ReportClient<C> {
        &self.client
    }

    /// Token and session failures abort the run; report failures are
    /// recorded per report according to the failure policy.
    pub async fn run(&self) -> Result<RunSummary> {
        let report_date = self.config.report_date();
        tracing::info!(
            "🚀 Fetching {} report(s) as of {}",
            self.config.reports().len(),
            report_date
        );

        let token = self
            .token_manager
            .acquire_token(self.config.credentials())
            .await?;
        let session = Arc::new(self.client.open_session(&token).await?);

        let requests = self.requests();
        let outcomes = if self.config.concurrent_requests() <= 1 {
            self.fetch_sequential(&session, requests).await
        } else {
            self.fetch_concurrent(&session, requests).await
        };

        if let Err(e) = self.client.close_session(&session).await {
            tracing::warn!("⚠️ Failed to close protocol session cleanly: {}", e);
        }

        let summary = RunSummary {
            report_date,
            outcomes,
        };
        tracing::info!(
            "📦 Run finished: {} saved, {} failed, {} skipped",
            summary.files_saved().len(),
            summary.failures().len(),
            summary.skipped().len()
        );

        Ok(summary)
    }

    /// Opens a session only to list the server's tools.
    pub async fn list_tools(&self) -> Result<Value> {
        let token = self
            .token_manager
            .acquire_token(self.config.credentials())
            .await?;
        let session = self.client.open_session(&token).await?;
        let tools = session.list_tools().await;
        if let Err(e) = self.client.close_session(&session).await {
            tracing::warn!("⚠️ Failed to close protocol session cleanly: {}", e);
        }
        tools
    }

    fn requests(&self) -> Vec<ReportRequest> {
        self.config
            .reports()
            .iter()
            .map(|report_type| {
                let request = ReportRequest::new(*report_type, self.config.report_date());
                match self.config.tenant() {
                    Some(tenant) => request.with_tenant(tenant),
                    None => request,
                }
            })
            .collect()
    }

    async fn fetch_sequential(
        &self,
        session: &Session,
        requests: Vec<ReportRequest>,
    ) -> Vec<ReportOutcome> {
        let policy = self.config.failure_policy();
        let prefix = self.config.output_prefix();
        let mut outcomes = Vec::with_capacity(requests.len());
        let mut aborted = false;

        for request in requests {
            let report_type = request.report_type;
            if aborted {
                tracing::info!("⏭️ Skipping {} (run aborted)", report_type);
                outcomes.push(ReportOutcome {
                    report_type,
                    status: ReportStatus::Skipped,
                });
                continue;
            }

            let status = fetch_and_persist(session, &self.storage, &request, prefix).await;
            if stops_run(&status, policy) {
                aborted = true;
            }
            outcomes.push(ReportOutcome {
                report_type,
                status,
            });
        }

        outcomes
    }

    async fn fetch_concurrent(
        &self,
        session: &Arc<Session>,
        requests: Vec<ReportRequest>,
    ) -> Vec<ReportOutcome> {
        let policy = self.config.failure_policy();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_requests()));
        let aborted = Arc::new(AtomicBool::new(false));
        let prefix: Arc<str> = Arc::from(self.config.output_prefix());

        let mut tasks = JoinSet::new();
        let report_types: Vec<ReportType> = requests.iter().map(|r| r.report_type).collect();

        for (index, request) in requests.into_iter().enumerate() {
            let session = Arc::clone(session);
            let storage = self.storage.clone();
            let semaphore = Arc::clone(&semaphore);
            let aborted = Arc::clone(&aborted);
            let prefix = Arc::clone(&prefix);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if aborted.load(Ordering::SeqCst) {
                    tracing::info!("⏭️ Skipping {} (run aborted)", request.report_type);
                    return (index, ReportStatus::Skipped);
                }

                let status = fetch_and_persist(&session, &storage, &request, &prefix).await;
                if stops_run(&status, policy) {
                    aborted.store(true, Ordering::SeqCst);
                }
                (index, status)
            });
        }

        let mut statuses: Vec<Option<ReportStatus>> = report_types.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, status)) => statuses[index] = Some(status),
                Err(e) => tracing::error!("❌ Report task panicked: {}", e),
            }
        }

        report_types
            .into_iter()
            .zip(statuses)
            .map(|(report_type, status)| ReportOutcome {
                report_type,
                status: status.unwrap_or_else(|| ReportStatus::Failed {
                    error: FetchError::TransportError {
                        message: format!("{} task did not complete", report_type),
                    },
                }),
            })
            .collect()
    }
}

/// 授權被拒時不論策略都停止送出新的請求
fn stops_run(status: &ReportStatus, policy: FailurePolicy) -> bool {
    match status {
        ReportStatus::Failed { error } if error.halts_run() => {
            tracing::error!(
                "🔐 Report server rejected the token; no further reports will be requested"
            );
            true
        }
        ReportStatus::Failed { .. } => policy == FailurePolicy::Abort,
        _ => false,
    }
}

async fn fetch_and_persist<S: Storage>(
    session: &Session,
    storage: &S,
    request: &ReportRequest,
    prefix: &str,
) -> ReportStatus {
    let report_type = request.report_type;

    let saved = async {
        let result = session.fetch_report(request).await?;
        if let Some(text) = result.tool_error_text() {
            if indicates_auth_failure(&text) {
                return Err(FetchError::UpstreamAuthenticationError {
                    report_type,
                    message: redact_secrets(&text),
                });
            }
            tracing::warn!(
                "⚠️ {} came back flagged as a tool error; saving it as received",
                report_type
            );
        }

        let body = serde_json::to_vec_pretty(&result.response)?;
        storage.write_file(&result.file_name(prefix), &body).await
    };

    match saved.await {
        Ok(path) => {
            tracing::info!("✅ {} saved to {}", report_type, path);
            ReportStatus::Saved { path }
        }
        Err(error) => {
            tracing::error!(
                "❌ {} failed ({:?}): {}",
                report_type,
                error.category(),
                error
            );
            ReportStatus::Failed { error }
        }
    }
}
