use anyhow::Context;
use clap::Parser;
use ledger_report_fetch::config::toml_config::TomlConfig;
use ledger_report_fetch::config::RunConfig;
use ledger_report_fetch::utils::logger;
use ledger_report_fetch::core::token::DEFAULT_VALIDATION_ENDPOINT;
use ledger_report_fetch::TokenManager;

/// Acquires a bearer token with the client-credentials grant and prints it.
#[derive(Parser)]
#[command(name = "acquire-token")]
#[command(about = "Exchange client credentials for a bearer token")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long)]
    client_id: Option<String>,

    #[arg(long)]
    client_secret: Option<String>,

    #[arg(long, value_delimiter = ',')]
    scopes: Vec<String>,

    #[arg(long)]
    token_endpoint: Option<String>,

    /// Print the full token instead of a masked one
    #[arg(long)]
    print_token: bool,

    /// Check the token with one authorised GET before printing it
    #[arg(long)]
    validate: bool,

    #[arg(long, default_value = DEFAULT_VALIDATION_ENDPOINT)]
    validation_endpoint: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let mut toml = match &args.config {
        Some(path) => TomlConfig::from_file(path)
            .with_context(|| format!("Failed to load config file '{}'", path))?,
        None => TomlConfig::default(),
    };

    if let Some(client_id) = args.client_id {
        toml.credentials.client_id = Some(client_id);
    }
    if let Some(client_secret) = args.client_secret {
        toml.credentials.client_secret = Some(client_secret);
    }
    if !args.scopes.is_empty() {
        toml.credentials.scopes = Some(args.scopes);
    }
    if let Some(endpoint) = args.token_endpoint {
        toml.identity.token_endpoint = Some(endpoint);
    }

    let config = RunConfig::from_toml(&toml, chrono::Local::now().date_naive())
        .context("Invalid configuration")?;
    let manager = TokenManager::new(config.identity.clone())?;

    let token = manager
        .acquire_token(&config.credentials)
        .await
        .with_context(|| format!("Token request to {} failed", manager.token_endpoint()))?;

    // 不寫入任何檔案
    if args.print_token {
        println!("{}", token.value());
    } else {
        println!("🔑 Token: {}", token.masked());
    }
    println!("⏰ Expires at: {}", token.expires_at());

    if args.validate {
        let valid = manager
            .validate_token(&token, &args.validation_endpoint)
            .await
            .with_context(|| format!("Could not reach {}", args.validation_endpoint))?;
        if valid {
            println!("✅ Validation: OK");
        } else {
            println!("⚠️ Validation failed (token may still be valid for other endpoints)");
        }
    }

    Ok(())
}
