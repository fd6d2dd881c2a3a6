pub mod engine;
pub mod rpc;
pub mod session;
pub mod token;

pub use crate::domain::ports::{ConfigProvider, Connector, MessageChannel, Storage};
pub use crate::utils::error::Result;
pub use engine::{ReportEngine, ReportOutcome, ReportStatus, RunSummary};
pub use session::{ReportClient, Session, SessionOptions};
pub use token::{ClientAuthMethod, IdentityConfig, TokenManager};
