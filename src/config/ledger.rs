//! Ledger policy loading from ledger.toml
//!
//! This module loads the tunable policy of the ledger: the legal accumulation cap
//! for percentage additives, the consumption ratio that flags a line as LOW, and
//! the retry policy applied to transactions that hit a write conflict. Every field
//! has a default, so a missing or empty file yields the statutory configuration.

use crate::errors::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides the policy file location
pub const LEDGER_CONFIG_ENV: &str = "LEDGER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "ledger.toml";

/// Configuration structure representing the entire ledger.toml file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Ceiling for the sum of active percentage additives on one contract
    /// (25 under Lei 14.133/21 Art. 124)
    pub legal_cap_percent: Decimal,
    /// consumed/total ratio at or above which a line is reported LOW
    pub low_balance_threshold: Decimal,
    /// Retry policy for serialization conflicts
    pub retry: RetryConfig,
}

/// Bounded retry with jittered backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Lower bound of the random sleep between attempts
    pub min_backoff_ms: u64,
    /// Upper bound of the random sleep between attempts
    pub max_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            legal_cap_percent: Decimal::from(25),
            low_balance_threshold: Decimal::new(9, 1),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff_ms: 1000,
            max_backoff_ms: 3000,
        }
    }
}

impl RetryConfig {
    /// Lower backoff bound as a `Duration`
    #[must_use]
    pub const fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    /// Upper backoff bound as a `Duration`
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl LedgerConfig {
    /// Checks that the policy values make sense together.
    ///
    /// # Errors
    /// Returns `Error::Config` if the cap is negative, the LOW threshold is outside
    /// (0, 1], no attempt is allowed, or the backoff bounds are inverted.
    pub fn validate(&self) -> Result<()> {
        if self.legal_cap_percent.is_sign_negative() {
            return Err(Error::Config {
                message: format!(
                    "legal_cap_percent must not be negative, got {}",
                    self.legal_cap_percent
                ),
            });
        }

        if self.low_balance_threshold <= Decimal::ZERO || self.low_balance_threshold > Decimal::ONE
        {
            return Err(Error::Config {
                message: format!(
                    "low_balance_threshold must be in (0, 1], got {}",
                    self.low_balance_threshold
                ),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }

        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config {
                message: format!(
                    "retry.min_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                    self.retry.min_backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }

        Ok(())
    }
}

/// Loads and validates the ledger policy from a TOML file
///
/// # Arguments
/// * `path` - Path to the ledger.toml file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A value fails [`LedgerConfig::validate`]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LedgerConfig> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    parse_config(&contents)
}

/// Parses and validates the ledger policy from TOML text
pub fn parse_config(contents: &str) -> Result<LedgerConfig> {
    let config: LedgerConfig = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse ledger.toml: {e}"),
    })?;
    config.validate()?;
    Ok(config)
}

/// Loads the ledger policy from `$LEDGER_CONFIG` or ./ledger.toml
///
/// A missing default file is not an error: the statutory defaults are used.
pub fn load_default_config() -> Result<LedgerConfig> {
    if let Ok(path) = std::env::var(LEDGER_CONFIG_ENV) {
        return load_config(path);
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        load_config(DEFAULT_CONFIG_PATH)
    } else {
        tracing::debug!("No {DEFAULT_CONFIG_PATH} found, using default ledger policy");
        Ok(LedgerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_ledger_config() {
        let toml_str = r"
            legal_cap_percent = 50
            low_balance_threshold = 0.8

            [retry]
            max_attempts = 5
            min_backoff_ms = 10
            max_backoff_ms = 20
        ";

        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.legal_cap_percent, Decimal::from(50));
        assert_eq!(config.low_balance_threshold, Decimal::new(8, 1));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.min_backoff(), Duration::from_millis(10));
        assert_eq!(config.retry.max_backoff(), Duration::from_millis(20));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.legal_cap_percent, Decimal::from(25));
        assert_eq!(config.low_balance_threshold, Decimal::new(9, 1));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.min_backoff_ms, 1000);
        assert_eq!(config.retry.max_backoff_ms, 3000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            parse_config("legal_cap_percent = -1"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            parse_config("low_balance_threshold = 1.5"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            parse_config("[retry]\nmax_attempts = 0"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            parse_config("[retry]\nmin_backoff_ms = 50\nmax_backoff_ms = 10"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(
            parse_config("legal_cap_percent = "),
            Err(Error::Config { .. })
        ));
    }
}
