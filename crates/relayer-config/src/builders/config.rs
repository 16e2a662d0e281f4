//! Configuration builder for creating test and development configurations.
//!
//! Builds a [`Config`] pointing at local nodes without going through TOML,
//! so tests can tweak only the fields they care about.

use crate::{Config, EndpointConfig, SignerConfig};
use relayer_types::{
	AgreementOptions, ChainConfig, DeliveryOptions, FallbackOptions, FeeMarket, NonceOptions,
};
use std::collections::HashMap;

/// Private key of the first well-known development account.
pub const DEV_PRIVATE_KEY: &str =
	"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	chains: HashMap<u64, ChainConfig>,
	agreement: AgreementOptions,
	nonce: NonceOptions,
	delivery: DeliveryOptions,
	private_key: Option<String>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	/// Creates a builder without chains and with the development signer.
	pub fn new() -> Self {
		Self {
			chains: HashMap::new(),
			agreement: AgreementOptions::default(),
			nonce: NonceOptions::default(),
			delivery: DeliveryOptions::default(),
			private_key: Some(DEV_PRIVATE_KEY.to_string()),
		}
	}

	/// Adds an EIP-1559 chain served by `rpc_urls`.
	pub fn chain(mut self, chain_id: u64, rpc_urls: &[&str]) -> Self {
		self.chains.insert(
			chain_id,
			ChainConfig {
				name: format!("chain-{}", chain_id),
				rpc_urls: rpc_urls.iter().map(|url| url.to_string()).collect(),
				avg_block_time_ms: 12_000,
				fee_market: FeeMarket::Eip1559,
				disable_custom_gas_oracle: false,
			},
		);
		self
	}

	/// Switches an already added chain to a gas price auction.
	pub fn auction(mut self, chain_id: u64) -> Self {
		if let Some(chain) = self.chains.get_mut(&chain_id) {
			chain.fee_market = FeeMarket::Auction;
		}
		self
	}

	pub fn agreement(mut self, agreement: AgreementOptions) -> Self {
		self.agreement = agreement;
		self
	}

	pub fn nonce(mut self, nonce: NonceOptions) -> Self {
		self.nonce = nonce;
		self
	}

	pub fn delivery(mut self, delivery: DeliveryOptions) -> Self {
		self.delivery = delivery;
		self
	}

	/// Drops the signer, leaving a read only configuration.
	pub fn without_signer(mut self) -> Self {
		self.private_key = None;
		self
	}

	/// Builds the `Config` with the configured values.
	pub fn build(self) -> Config {
		let signer = self.private_key.map(|key| {
			let mut local = toml::map::Map::new();
			local.insert("private_key".to_string(), toml::Value::String(key));
			SignerConfig {
				primary: "local".to_string(),
				implementations: HashMap::from([("local".to_string(), toml::Value::Table(local))]),
			}
		});

		Config {
			chains: self.chains,
			endpoint: EndpointConfig::default(),
			fallback: FallbackOptions::default(),
			agreement: self.agreement,
			nonce: self.nonce,
			delivery: self.delivery,
			signer,
			gas_oracles: HashMap::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_builder_defaults() {
		let config = ConfigBuilder::new()
			.chain(1, &["http://localhost:8545"])
			.chain(56, &["http://localhost:8546"])
			.auction(56)
			.build();

		assert_eq!(config.chains.len(), 2);
		assert_eq!(config.delivery_for(56).unwrap().fee_market, FeeMarket::Auction);
		assert_eq!(config.delivery_for(1).unwrap().fee_market, FeeMarket::Eip1559);
		assert!(config.validate().is_ok());
		let signer = config.signer.unwrap();
		assert_eq!(
			signer.primary_config().unwrap()["private_key"].as_str(),
			Some(DEV_PRIVATE_KEY)
		);
	}

	#[test]
	fn test_builder_without_chains_is_invalid() {
		let config = ConfigBuilder::new().without_signer().build();
		assert!(config.signer.is_none());
		assert!(config.validate().is_err());
	}
}
