//! deployment configuration
//!
//! everything is injected at startup: contract addresses, chain, coordinator
//! url and node endpoint. there is no runtime configuration protocol.

use crate::abi::Address;
use crate::chain::to_backend_chain_format;
use crate::error::{Error, Result};
use crate::schema::VoteMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_COORDINATOR_URL: &str = "COORDINATOR_SERVICE_URL";
pub const ENV_COORDINATOR_AUTH_TOKEN: &str = "COORDINATOR_AUTH_TOKEN";
pub const ENV_COORDINATOR_TIMEOUT: &str = "COORDINATOR_TIMEOUT_SECS";
pub const ENV_MACI_ADDRESS: &str = "MACI_ADDRESS";
pub const ENV_MACI_DEPLOYMENT_BLOCK: &str = "MACI_DEPLOYMENT_BLOCK";
pub const ENV_VOTING_PLUGIN_ADDRESS: &str = "MACI_VOTING_PLUGIN_ADDRESS";
pub const ENV_CHAIN_NAME: &str = "CHAIN_NAME";
pub const ENV_WEB3_ENDPOINT: &str = "WEB3_ENDPOINT";
pub const ENV_SECONDS_PER_BLOCK: &str = "SECONDS_PER_BLOCK";
pub const ENV_BLOCKS_PER_BATCH: &str = "BLOCKS_PER_BATCH";

/// finalization and poll-read configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// coordinator service base url, e.g. `http://localhost:3000/v1`
    pub coordinator_url: String,
    /// static authorization header value (sent as-is)
    pub auth_token: Option<String>,
    /// per-request timeout for coordinator calls in seconds
    pub timeout_secs: u64,
    /// maci main contract
    pub maci_address: Address,
    /// block the maci contract was deployed at (start of event processing)
    pub maci_deployment_block: u64,
    /// maci voting governance plugin
    pub voting_plugin_address: Address,
    /// frontend chain name (camelCase)
    pub chain_name: String,
    /// json-rpc endpoint of the chain
    pub rpc_endpoint: String,
    /// average block time used to estimate future block numbers
    pub seconds_per_block: u64,
    /// event batch size requested from the coordinator
    pub blocks_per_batch: u64,
    /// voting mode the polls were deployed with
    pub mode: VoteMode,
    /// poll data refresh interval while voting is open
    pub refresh_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:3000/v1".into(),
            auth_token: None,
            timeout_secs: 900,
            maci_address: Address::ZERO,
            maci_deployment_block: 0,
            voting_plugin_address: Address::ZERO,
            chain_name: "sepolia".into(),
            rpc_endpoint: "http://localhost:8545".into(),
            seconds_per_block: 1,
            blocks_per_batch: 20,
            mode: VoteMode::NonQv,
            refresh_interval_secs: 10,
        }
    }
}

impl Config {
    /// load from process environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// load using an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_COORDINATOR_URL) {
            config.coordinator_url = url;
        }
        config.auth_token = lookup(ENV_COORDINATOR_AUTH_TOKEN).filter(|t| !t.is_empty());
        if let Some(v) = parse_var(&lookup, ENV_COORDINATOR_TIMEOUT)? {
            config.timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MACI_ADDRESS)? {
            config.maci_address = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MACI_DEPLOYMENT_BLOCK)? {
            config.maci_deployment_block = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_VOTING_PLUGIN_ADDRESS)? {
            config.voting_plugin_address = v;
        }
        if let Some(name) = lookup(ENV_CHAIN_NAME).filter(|n| !n.is_empty()) {
            config.chain_name = name;
        }
        if let Some(endpoint) = lookup(ENV_WEB3_ENDPOINT) {
            config.rpc_endpoint = endpoint;
        }
        if let Some(v) = parse_var(&lookup, ENV_SECONDS_PER_BLOCK)? {
            config.seconds_per_block = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BLOCKS_PER_BATCH)? {
            config.blocks_per_batch = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// load from a toml file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("invalid toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator_url.trim().is_empty() {
            return Err(Error::Config("coordinator url is empty".into()));
        }
        if self.seconds_per_block == 0 {
            return Err(Error::Config("seconds per block must be positive".into()));
        }
        if self.blocks_per_batch == 0 {
            return Err(Error::Config("blocks per batch must be positive".into()));
        }
        Ok(())
    }

    /// chain identifier in the coordinator's format
    pub fn backend_chain(&self) -> String {
        to_backend_chain_format(&self.chain_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
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
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.chain_name, "sepolia");
        assert_eq!(config.blocks_per_batch, 20);
        assert_eq!(config.seconds_per_block, 1);
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_COORDINATOR_URL, "https://coordinator.example/v1"),
            (ENV_MACI_ADDRESS, "0x00000000000000000000000000000000000000aa"),
            (ENV_MACI_DEPLOYMENT_BLOCK, "1234"),
            (ENV_CHAIN_NAME, "arbitrumSepolia"),
            (ENV_SECONDS_PER_BLOCK, "12"),
            (ENV_COORDINATOR_AUTH_TOKEN, ""),
        ]))
        .unwrap();

        assert_eq!(config.coordinator_url, "https://coordinator.example/v1");
        assert_eq!(config.maci_address.0[19], 0xaa);
        assert_eq!(config.maci_deployment_block, 1234);
        assert_eq!(config.backend_chain(), "arbitrum-sepolia");
        assert_eq!(config.seconds_per_block, 12);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_lookup(lookup_from(&[(ENV_MACI_DEPLOYMENT_BLOCK, "abc")]));
        assert!(matches!(err, Err(Error::Config(_))));

        let err = Config::from_lookup(lookup_from(&[(ENV_SECONDS_PER_BLOCK, "0")]));
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maci.toml");
        std::fs::write(
            &path,
            r#"
coordinator_url = "http://coordinator:3000/v1"
maci_address = "0x00000000000000000000000000000000000000bb"
chain_name = "polygon"
mode = 0
"#,
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.backend_chain(), "matic");
        assert_eq!(config.mode, VoteMode::Qv);
        assert_eq!(config.timeout_secs, 900);
    }
}
