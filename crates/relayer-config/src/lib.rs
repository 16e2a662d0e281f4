//! Configuration module for the relayer system.
//!
//! This module provides structures and utilities for managing relayer configuration.
//! It supports loading configuration from TOML files and provides validation to ensure
//! all required configuration values are properly set.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files for better organization:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

mod loader;

/// Builders for test and development configurations.
#[cfg(any(test, feature = "testing"))]
pub mod builders {
	pub mod config;
}

pub use loader::ConfigLoader;

use regex::Regex;
use relayer_types::{
	deserialize_chains, AgreementOptions, ChainConfig, ChainsConfig, DeliveryOptions,
	FallbackOptions, FeeMarket, FeeStructure, NonceOptions,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message only; the default rendering repeats the whole input.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Chains and their RPC endpoints.
	#[serde(deserialize_with = "deserialize_chains")]
	pub chains: ChainsConfig,
	/// Endpoint implementation used for every RPC URL.
	#[serde(default)]
	pub endpoint: EndpointConfig,
	#[serde(default)]
	pub fallback: FallbackOptions,
	#[serde(default)]
	pub agreement: AgreementOptions,
	#[serde(default)]
	pub nonce: NonceOptions,
	#[serde(default)]
	pub delivery: DeliveryOptions,
	/// Signer used for deliveries. Read only commands work without one.
	pub signer: Option<SignerConfig>,
	/// Fixed fees per chain id, used instead of estimation.
	#[serde(default, deserialize_with = "deserialize_gas_oracles")]
	pub gas_oracles: HashMap<u64, FeeStructure>,
}

/// Configuration of the endpoint implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
	/// Which implementation to use as primary.
	#[serde(default = "default_endpoint_implementation")]
	pub primary: String,
	/// Map of endpoint implementation names to their configurations.
	///
	/// The `url` key is filled in per RPC URL of a chain.
	#[serde(default)]
	pub implementations: HashMap<String, toml::Value>,
}

fn default_endpoint_implementation() -> String {
	"http".to_string()
}

impl Default for EndpointConfig {
	fn default() -> Self {
		Self {
			primary: default_endpoint_implementation(),
			implementations: HashMap::new(),
		}
	}
}

impl EndpointConfig {
	/// Implementation config for one RPC URL.
	pub fn config_for(&self, url: &str) -> toml::Value {
		let mut table = self
			.implementations
			.get(&self.primary)
			.and_then(|value| value.as_table())
			.cloned()
			.unwrap_or_default();
		table.insert("url".to_string(), toml::Value::String(url.to_string()));
		toml::Value::Table(table)
	}
}

/// Configuration for transaction signing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignerConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of signer implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

impl SignerConfig {
	/// Configuration of the primary implementation.
	pub fn primary_config(&self) -> Option<&toml::Value> {
		self.implementations.get(&self.primary)
	}
}

fn deserialize_gas_oracles<'de, D>(deserializer: D) -> Result<HashMap<u64, FeeStructure>, D::Error>
where
	D: Deserializer<'de>,
{
	let string_map: HashMap<String, FeeStructure> = HashMap::deserialize(deserializer)?;
	string_map
		.into_iter()
		.map(|(key, value)| {
			key.parse::<u64>()
				.map(|chain_id| (chain_id, value))
				.map_err(|e| serde::de::Error::custom(format!("Invalid chain_id '{}': {}", key, e)))
		})
		.collect()
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB to prevent ReDoS attacks.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut output = String::with_capacity(input.len());
	let mut last = 0;
	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(value) => value,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};
		output.push_str(&input[last..full_match.start()]);
		output.push_str(&value);
		last = full_match.end();
	}
	output.push_str(&input[last..]);

	Ok(output)
}

impl Config {
	/// Loads configuration from a file, resolving includes and environment variables.
	///
	/// Each top-level section must be unique across all configuration files.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Returns the configuration of `chain_id`.
	pub fn chain(&self, chain_id: u64) -> Result<&ChainConfig, ConfigError> {
		self.chains.get(&chain_id).ok_or_else(|| {
			ConfigError::Validation(format!("Chain {} is not configured", chain_id))
		})
	}

	/// Delivery options with the chain's fee market applied.
	pub fn delivery_for(&self, chain_id: u64) -> Result<DeliveryOptions, ConfigError> {
		let chain = self.chain(chain_id)?;
		Ok(DeliveryOptions {
			fee_market: chain.fee_market,
			force_disable_custom_gas_oracle: self.delivery.force_disable_custom_gas_oracle
				|| chain.disable_custom_gas_oracle,
			..self.delivery.clone()
		})
	}

	/// Agreement options with the chain's block time applied.
	pub fn agreement_for(&self, chain_id: u64) -> Result<AgreementOptions, ConfigError> {
		let chain = self.chain(chain_id)?;
		Ok(AgreementOptions {
			avg_block_time_ms: chain.avg_block_time_ms,
			..self.agreement.clone()
		})
	}

	/// Validates the configuration to ensure all required fields are properly set.
	///
	/// Checks every chain, the router and nonce options, delivery ranges, the
	/// signer selection and that gas oracles match their chain's fee market.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.chains.is_empty() {
			return Err(ConfigError::Validation(
				"At least one chain must be configured".into(),
			));
		}
		for (chain_id, chain) in &self.chains {
			if chain.rpc_urls.is_empty() {
				return Err(ConfigError::Validation(format!(
					"Chain {} must have at least one rpc url",
					chain_id
				)));
			}
			for url in &chain.rpc_urls {
				if !url.starts_with("http://") && !url.starts_with("https://") {
					return Err(ConfigError::Validation(format!(
						"Chain {} rpc url '{}' must start with http:// or https://",
						chain_id, url
					)));
				}
			}
			let mut unique = chain.rpc_urls.clone();
			unique.sort();
			unique.dedup();
			if unique.len() != chain.rpc_urls.len() {
				return Err(ConfigError::Validation(format!(
					"Chain {} lists the same rpc url twice",
					chain_id
				)));
			}
			if chain.avg_block_time_ms == 0 {
				return Err(ConfigError::Validation(format!(
					"Chain {} avg_block_time_ms must be greater than 0",
					chain_id
				)));
			}
		}

		if self.fallback.single_endpoint_timeout_ms == 0 {
			return Err(ConfigError::Validation(
				"fallback.single_endpoint_timeout_ms must be greater than 0".into(),
			));
		}
		if self.fallback.all_endpoints_timeout_ms < self.fallback.single_endpoint_timeout_ms {
			return Err(ConfigError::Validation(
				"fallback.all_endpoints_timeout_ms cannot be lower than single_endpoint_timeout_ms"
					.into(),
			));
		}

		if self.agreement.quorum < 2 {
			return Err(ConfigError::Validation(
				"agreement.quorum must be at least 2".into(),
			));
		}
		if let Some(curated) = &self.agreement.curated_list {
			if !(0.0..=1.0).contains(&curated.max_error_rate) {
				return Err(ConfigError::Validation(
					"agreement.curated_list.max_error_rate must be between 0 and 1".into(),
				));
			}
			if curated.evaluation_interval_ms == 0 || curated.reset_quarantine_interval_ms == 0 {
				return Err(ConfigError::Validation(
					"agreement.curated_list intervals must be greater than 0".into(),
				));
			}
		}

		if self.nonce.quorum == 0 {
			return Err(ConfigError::Validation(
				"nonce.quorum must be at least 1".into(),
			));
		}
		if self.nonce.max_pending_per_tick == 0 {
			return Err(ConfigError::Validation(
				"nonce.max_pending_per_tick must be at least 1".into(),
			));
		}
		if self.nonce.max_pending_tracked < self.nonce.max_pending_per_tick {
			return Err(ConfigError::Validation(
				"nonce.max_pending_tracked cannot be lower than max_pending_per_tick".into(),
			));
		}

		self.delivery
			.validate()
			.map_err(|e| ConfigError::Validation(format!("delivery: {}", e)))?;

		if let Some(signer) = &self.signer {
			if signer.primary.is_empty() {
				return Err(ConfigError::Validation(
					"Signer primary implementation cannot be empty".into(),
				));
			}
			if signer.primary_config().is_none() {
				return Err(ConfigError::Validation(format!(
					"Primary signer '{}' not found in implementations",
					signer.primary
				)));
			}
		}

		if self.endpoint.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Endpoint primary implementation cannot be empty".into(),
			));
		}

		for (chain_id, fees) in &self.gas_oracles {
			let chain = self.chains.get(chain_id).ok_or_else(|| {
				ConfigError::Validation(format!(
					"Gas oracle references chain {} which doesn't exist in chains config",
					chain_id
				))
			})?;
			let matches_market = matches!(
				(chain.fee_market, fees),
				(FeeMarket::Eip1559, FeeStructure::Eip1559(_))
					| (FeeMarket::Auction, FeeStructure::Auction(_))
			);
			if !matches_market {
				return Err(ConfigError::Validation(format!(
					"Gas oracle for chain {} does not match its fee market",
					chain_id
				)));
			}
		}

		Ok(())
	}
}

/// Implementation of FromStr trait for Config to enable parsing from string.
///
/// Environment variables are resolved and the configuration is validated
/// after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relayer_types::BlockTag;

	const MINIMAL: &str = r#"
[chains.1]
rpc_urls = ["http://localhost:8545", "http://localhost:8546"]
"#;

	#[test]
	fn test_env_var_resolution() {
		std::env::set_var("RELAYER_TEST_HOST", "localhost");
		std::env::set_var("RELAYER_TEST_PORT", "8545");

		let input = "url = \"http://${RELAYER_TEST_HOST}:${RELAYER_TEST_PORT}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "url = \"http://localhost:8545\"");

		std::env::remove_var("RELAYER_TEST_HOST");
		std::env::remove_var("RELAYER_TEST_PORT");
	}

	#[test]
	fn test_env_var_with_default() {
		let input = "value = \"${RELAYER_MISSING_VAR:-fallback}\"";
		assert_eq!(resolve_env_vars(input).unwrap(), "value = \"fallback\"");
	}

	#[test]
	fn test_missing_env_var_error() {
		let result = resolve_env_vars("value = \"${RELAYER_MISSING_VAR}\"");
		assert!(result.unwrap_err().to_string().contains("RELAYER_MISSING_VAR"));
	}

	#[test]
	fn test_defaults_apply() {
		let config: Config = MINIMAL.parse().unwrap();
		let chain = config.chain(1).unwrap();
		assert_eq!(chain.rpc_urls.len(), 2);
		assert_eq!(config.endpoint.primary, "http");
		assert_eq!(config.agreement.quorum, 2);
		assert_eq!(config.delivery.max_attempts, 10);
		assert_eq!(config.delivery.percentiles, vec![75.0]);
		assert_eq!(config.delivery.newest_block_for_fee_history, BlockTag::Pending);
		assert!(config.signer.is_none());
		assert!(config.chain(2).is_err());
	}

	#[test]
	fn test_full_config() {
		std::env::set_var("RELAYER_TEST_KEY", "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80");
		let config: Config = r#"
[chains.10]
name = "optimism"
rpc_urls = ["https://a.example", "https://b.example", "https://c.example"]
avg_block_time_ms = 2000
disable_custom_gas_oracle = true

[chains.56]
rpc_urls = ["https://bsc.example"]
fee_market = "auction"

[endpoint]
primary = "http"
[endpoint.implementations.http]
poll_interval_ms = 1000

[agreement]
quorum = 3
require_explicit_block_tag = true
[agreement.curated_list]
max_error_rate = 0.2

[nonce]
fast_mode = true

[delivery]
max_attempts = 5
percentiles = [50, 75, 90]
reward_aggregation = "median"

[signer]
primary = "local"
[signer.implementations.local]
private_key = "${RELAYER_TEST_KEY}"

[gas_oracles.56]
type = "auction"
gas_price = 3000000000
"#
		.parse()
		.unwrap();
		std::env::remove_var("RELAYER_TEST_KEY");

		assert_eq!(config.agreement.quorum, 3);
		assert!(config.nonce.fast_mode);
		assert_eq!(config.gas_oracles[&56], FeeStructure::auction(3_000_000_000));

		let endpoint = config.endpoint.config_for("https://a.example");
		assert_eq!(endpoint["url"].as_str(), Some("https://a.example"));
		assert_eq!(endpoint["poll_interval_ms"].as_integer(), Some(1000));

		let delivery = config.delivery_for(56).unwrap();
		assert_eq!(delivery.fee_market, FeeMarket::Auction);
		assert_eq!(delivery.max_attempts, 5);
		assert!(config.delivery_for(10).unwrap().force_disable_custom_gas_oracle);
		assert_eq!(config.agreement_for(10).unwrap().avg_block_time_ms, 2000);

		let signer = config.signer.as_ref().unwrap();
		assert!(signer.primary_config().unwrap()["private_key"]
			.as_str()
			.unwrap()
			.starts_with("0xac09"));
	}

	#[test]
	fn test_validation_errors() {
		let cases = [
			("[chains.1]\nrpc_urls = []", "at least one rpc url"),
			("[chains.1]\nrpc_urls = [\"ws://x\"]", "must start with http"),
			("[chains.1]\nrpc_urls = [\"http://a\", \"http://a\"]", "same rpc url twice"),
			(
				"[chains.1]\nrpc_urls = [\"http://a\"]\n[agreement]\nquorum = 1",
				"quorum must be at least 2",
			),
			(
				"[chains.1]\nrpc_urls = [\"http://a\"]\n[delivery]\npercentiles = [90, 50]",
				"ascending",
			),
			(
				"[chains.1]\nrpc_urls = [\"http://a\"]\n[signer]\nprimary = \"kms\"\n[signer.implementations.local]\nprivate_key = \"0x1\"",
				"Primary signer 'kms'",
			),
			(
				"[chains.1]\nrpc_urls = [\"http://a\"]\n[gas_oracles.1]\ntype = \"auction\"\ngas_price = 1",
				"does not match its fee market",
			),
			(
				"[chains.1]\nrpc_urls = [\"http://a\"]\n[gas_oracles.2]\ntype = \"auction\"\ngas_price = 1",
				"chain 2 which doesn't exist",
			),
		];
		for (input, expected) in cases {
			let error = input.parse::<Config>().unwrap_err().to_string();
			assert!(error.contains(expected), "{} did not contain {}", error, expected);
		}
	}

	#[test]
	fn test_invalid_chain_id_key() {
		let error = "[chains.mainnet]\nrpc_urls = [\"http://a\"]"
			.parse::<Config>()
			.unwrap_err();
		assert!(error.to_string().contains("Invalid chain_id 'mainnet'"));
	}
}
