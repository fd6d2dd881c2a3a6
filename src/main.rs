use clap::Parser;
use ledger_report_fetch::core::engine::ReportStatus;
use ledger_report_fetch::utils::error::{ErrorSeverity, FetchError};
use ledger_report_fetch::utils::logger;
use ledger_report_fetch::{
    CliConfig, LocalStorage, ReportClient, ReportEngine, RunSummary, StdioConnector, TokenManager,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting ledger-report-fetch");

    // 載入並驗證配置
    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };
    tracing::debug!("Resolved config: {:?}", config);

    let token_manager = match TokenManager::new(config.identity.clone()) {
        Ok(manager) => manager,
        Err(e) => exit_with(&e),
    };
    let storage = LocalStorage::new(&config.output_path);
    tracing::info!("📁 Output directory: {}", storage.base_path().display());
    let client = ReportClient::new(
        StdioConnector::new(config.server.clone()),
        config.session.clone(),
    );
    let engine = ReportEngine::new(token_manager, client, storage, config);

    if cli.list_tools {
        match engine.list_tools().await {
            Ok(tools) => {
                println!("{}", serde_json::to_string_pretty(&tools)?);
                return Ok(());
            }
            Err(e) => exit_with(&e),
        }
    }

    match engine.run().await {
        Ok(summary) => {
            print_summary(&summary);
            if !summary.is_success() {
                // 部分報表失敗
                std::process::exit(1);
            }
        }
        Err(e) => exit_with(&e),
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("📅 Report date: {}", summary.report_date);
    for outcome in &summary.outcomes {
        match &outcome.status {
            ReportStatus::Saved { path } => {
                println!("✅ {}: {}", outcome.report_type, path);
            }
            ReportStatus::Failed { error } => {
                eprintln!(
                    "❌ {} ({:?}): {}",
                    outcome.report_type,
                    error.category(),
                    error.user_friendly_message()
                );
                eprintln!("💡 Suggestion: {}", error.recovery_suggestion());
                if error.is_retryable() {
                    eprintln!("🔁 This failure is transient; re-running may succeed");
                }
            }
            ReportStatus::Skipped => {
                eprintln!("⏭️ {}: skipped", outcome.report_type);
            }
        }
    }
}

fn exit_with(e: &FetchError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ Run failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 Suggestion: {}", e.recovery_suggestion());

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = match e.severity() {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code)
}
