//! Transaction signing for the relayer system.
//!
//! The delivery engine never holds keys itself. It hands a fully populated
//! [`UnsignedTx`] to a [`SignerInterface`] implementation and broadcasts the
//! returned EIP-2718 encoded bytes.

use async_trait::async_trait;
use relayer_types::{Address, Bytes, ConfigSchema, ImplementationRegistry, UnsignedTx};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod local;
}

/// Errors that can occur during signing operations.
#[derive(Debug, Error)]
pub enum AccountError {
	/// Error that occurs when signing operations fail.
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	/// Error that occurs when a cryptographic key is invalid or malformed.
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	#[error("Implementation error: {0}")]
	Implementation(String),
}

/// Trait defining the interface for signer implementations.
#[async_trait]
pub trait SignerInterface: Send + Sync {
	/// Returns the configuration schema for this signer implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Address transactions are sent from.
	fn address(&self) -> Address;

	/// Signs `tx` and returns its EIP-2718 encoding, ready for
	/// `eth_sendRawTransaction`.
	///
	/// EIP-1559 fees produce a type 2 transaction and an auction gas price a
	/// legacy one.
	async fn sign_transaction(&self, tx: &UnsignedTx) -> Result<Bytes, AccountError>;
}

/// Type alias for signer factory functions.
pub type SignerFactory = fn(&toml::Value) -> Result<Box<dyn SignerInterface>, AccountError>;

/// Registry trait for signer implementations.
pub trait SignerRegistry: ImplementationRegistry<Factory = SignerFactory> {}

/// Get all registered signer implementations.
///
/// Returns a vector of (name, factory) tuples for all available signer implementations.
pub fn get_all_implementations() -> Vec<(&'static str, SignerFactory)> {
	use implementations::local;

	vec![(local::Registry::NAME, local::Registry::factory())]
}
