//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{IndexerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// EVM JSON-RPC endpoint (e.g. http://127.0.0.1:8545)
    pub rpc_url: String,
    /// The FundChain contract address, lower-cased
    pub contract_address: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the live subscription polls for new logs
    pub poll_interval_secs: u64,
    /// Number of blocks re-scanned behind the chain head on startup
    pub catch_up_window: u64,
    /// How many of the newest donations are included in a campaign aggregate
    pub recent_donations: i64,
    /// HTTP timeout for chain RPC calls
    pub rpc_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let contract_address = lookup("CONTRACT_ADDRESS").ok_or_else(|| {
            IndexerError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
        })?;

        let poll_interval_secs = parse_or(&lookup, "POLL_INTERVAL_SECS", 5)?;
        if poll_interval_secs == 0 {
            return Err(IndexerError::Config(
                "POLL_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            rpc_url: lookup("RPC_URL").unwrap_or_else(|| "http://127.0.0.1:8545".to_string()),
            contract_address: contract_address.trim().to_lowercase(),
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./fundchain.db".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 3001)?,
            poll_interval_secs,
            catch_up_window: parse_or(&lookup, "CATCH_UP_WINDOW", 100)?,
            recent_donations: parse_or(&lookup, "RECENT_DONATIONS", 10)?,
            rpc_timeout_secs: parse_or(&lookup, "RPC_TIMEOUT_SECS", 30)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| IndexerError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_contract_is_set() {
        let config =
            Config::from_lookup(lookup_from(&[("CONTRACT_ADDRESS", "0xABCDEF")])).unwrap();
        assert_eq!(config.contract_address, "0xabcdef");
        assert_eq!(config.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(config.api_port, 3001);
        assert_eq!(config.catch_up_window, 100);
        assert_eq!(config.recent_donations, 10);
        assert_eq!(config.poll_interval_secs, 5);
    }

    #[test]
    fn missing_contract_is_a_config_error() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("CONTRACT_ADDRESS", "0x1"),
            ("CATCH_UP_WINDOW", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("CATCH_UP_WINDOW"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("CONTRACT_ADDRESS", "0x1"),
            ("POLL_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
        assert!(err.to_string().contains("POLL_INTERVAL_SECS"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("CONTRACT_ADDRESS", "0x1"),
            ("CATCH_UP_WINDOW", "250"),
            ("API_PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(config.catch_up_window, 250);
        assert_eq!(config.api_port, 8080);
    }
}
