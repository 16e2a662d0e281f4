//! Local private key signer.
//!
//! Keeps the key in process memory and signs with `alloy-signer-local`.

use crate::{AccountError, SignerInterface};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use relayer_types::{
	Address, Bytes, ConfigSchema, FeeStructure, Field, FieldType, Schema, SecretString,
	UnsignedTx, ValidationError,
};

/// Signer holding a private key in memory.
pub struct LocalSigner {
	address: Address,
	wallet: EthereumWallet,
}

impl LocalSigner {
	/// Creates a signer from a hex private key, with or without `0x`.
	pub fn new(private_key: &SecretString) -> Result<Self, AccountError> {
		let signer: PrivateKeySigner = private_key.with_exposed(|key| {
			key.trim_start_matches("0x")
				.parse()
				.map_err(|_| AccountError::InvalidKey("Invalid private key format".to_string()))
		})?;
		let address = signer.address();
		Ok(Self {
			address,
			wallet: EthereumWallet::from(signer),
		})
	}
}

fn to_request(tx: &UnsignedTx) -> TransactionRequest {
	let request = TransactionRequest::default()
		.with_from(tx.from)
		.with_to(tx.to)
		.with_input(tx.data.clone())
		.with_value(tx.value)
		.with_chain_id(tx.chain_id)
		.with_nonce(tx.nonce)
		.with_gas_limit(tx.gas_limit);

	match tx.fee {
		FeeStructure::Eip1559(fee) => request
			.with_max_fee_per_gas(fee.max_fee_per_gas)
			.with_max_priority_fee_per_gas(fee.max_priority_fee_per_gas),
		FeeStructure::Auction(fee) => request.with_gas_price(fee.gas_price),
	}
}

#[async_trait]
impl SignerInterface for LocalSigner {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalSignerSchema)
	}

	fn address(&self) -> Address {
		self.address
	}

	async fn sign_transaction(&self, tx: &UnsignedTx) -> Result<Bytes, AccountError> {
		if tx.from != self.address {
			return Err(AccountError::SigningFailed(format!(
				"Transaction sender {} does not match signer {}",
				tx.from, self.address
			)));
		}

		let envelope = to_request(tx)
			.build(&self.wallet)
			.await
			.map_err(|e| AccountError::SigningFailed(e.to_string()))?;

		tracing::trace!(nonce = tx.nonce, tx_type = tx.tx_type(), "Signed transaction");
		Ok(Bytes::from(envelope.encoded_2718()))
	}
}

/// Configuration schema for the local signer.
pub struct LocalSignerSchema;

impl LocalSignerSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		Self.validate(config)
	}
}

impl ConfigSchema for LocalSignerSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("private_key", FieldType::String).with_validator(|value| {
				let key = value.as_str().unwrap_or_default();
				let hex = key.strip_prefix("0x").unwrap_or(key);
				if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
					return Err("Private key must be 64 hex characters".to_string());
				}
				Ok(())
			})],
			vec![],
		);

		schema.validate(config)
	}
}

/// Factory function to create a local signer from configuration.
///
/// Configuration parameters:
/// - `private_key`: hex private key, usually `${RELAYER_PRIVATE_KEY}` (required)
pub fn create_signer(config: &toml::Value) -> Result<Box<dyn SignerInterface>, AccountError> {
	LocalSignerSchema::validate_config(config)
		.map_err(|e| AccountError::InvalidKey(format!("Invalid configuration: {}", e)))?;

	let private_key = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.map(SecretString::from)
		.ok_or_else(|| AccountError::InvalidKey("private_key is required".to_string()))?;

	Ok(Box::new(LocalSigner::new(&private_key)?))
}

/// Registry for the local signer implementation.
pub struct Registry;

impl relayer_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "local";
	type Factory = crate::SignerFactory;

	fn factory() -> Self::Factory {
		create_signer
	}
}

impl crate::SignerRegistry for Registry {}
