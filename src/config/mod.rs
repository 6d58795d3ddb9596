/// Database configuration and connection management
pub mod database;

/// Ledger policy loading from ledger.toml
pub mod ledger;

pub use ledger::{LedgerConfig, RetryConfig};
