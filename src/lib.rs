pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::{cli::LocalStorage, RunConfig};

pub use adapters::{MemoryConnector, ServerCommand, StdioConnector};
pub use core::{
    ReportClient, ReportEngine, RunSummary, Session, SessionOptions, TokenManager,
};
pub use domain::model::{BearerToken, Credentials, ReportRequest, ReportResult, ReportType, Scope};
pub use utils::error::{FetchError, Result};
