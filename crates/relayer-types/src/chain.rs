//! Chain configuration types for multi-endpoint operation.
//!
//! Each chain lists the RPC endpoints the relayer fans out to, the average
//! block time used for delivery pacing and block sanity checks, and the fee
//! market the chain runs.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Fee market model of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeMarket {
	/// Base fee plus priority fee (type 2 transactions).
	#[default]
	Eip1559,
	/// Single gas price auction (type 0 transactions).
	Auction,
}

/// Configuration for a single chain.
///
/// # Fields
///
/// * `name` - Human readable chain name used in logs
/// * `rpc_urls` - Ordered list of endpoint URLs, the first one starts as active
/// * `avg_block_time_ms` - Average block time in milliseconds
/// * `fee_market` - Fee market model of the chain
/// * `disable_custom_gas_oracle` - Skip any custom gas oracle registered for this chain
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
	#[serde(default)]
	pub name: String,
	pub rpc_urls: Vec<String>,
	#[serde(default = "default_avg_block_time_ms")]
	pub avg_block_time_ms: u64,
	#[serde(default)]
	pub fee_market: FeeMarket,
	#[serde(default)]
	pub disable_custom_gas_oracle: bool,
}

fn default_avg_block_time_ms() -> u64 {
	12_000
}

/// Chains configuration mapping chain ids to their configurations.
///
/// TOML tables cannot have numeric keys, so chain ids are written as string
/// keys and converted with [`deserialize_chains`].
pub type ChainsConfig = HashMap<u64, ChainConfig>;

/// Deserializes a chain table whose keys are chain ids written as strings.
///
/// # Errors
///
/// Returns a deserialization error if a key is not a valid `u64`.
pub fn deserialize_chains<'de, D>(deserializer: D) -> Result<ChainsConfig, D::Error>
where
	D: Deserializer<'de>,
{
	let string_map: HashMap<String, ChainConfig> = HashMap::deserialize(deserializer)?;
	string_map
		.into_iter()
		.map(|(key, value)| {
			key.parse::<u64>()
				.map(|chain_id| (chain_id, value))
				.map_err(|e| serde::de::Error::custom(format!("Invalid chain_id '{}': {}", key, e)))
		})
		.collect()
}
