pub mod config;
pub mod coordinator;
pub mod error;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod types;
pub mod undercut;
pub mod utils;

// Re-export the pieces embedders wire together.
pub use coordinator::{Phase, RefreshCoordinator};
pub use error::{DeskError, Result};
pub use rate_limit::RateLimitMonitor;
pub use service::{HttpTradeDataService, TradeDataService};
pub use store::{RefreshClaim, ResultStore};
