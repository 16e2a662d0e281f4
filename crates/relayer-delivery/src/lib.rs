//! Transaction delivery for the relayer system.
//!
//! This crate turns a call description into a mined transaction. It allocates
//! nonces, estimates fees and gas limits, signs through the account crate and
//! rebroadcasts with rising fees until the account nonce moves past the
//! delivered one. [`TxDeliveryMan`] fans one transaction out over every
//! configured endpoint and returns the first successful delivery.

use relayer_account::AccountError;
use relayer_router::RouterError;
use relayer_rpc::RpcError;
use relayer_types::B256;
use thiserror::Error;

pub mod delivery_man;
pub mod gas;
pub mod nonce_coordinator;
pub mod nonce_fetcher;
pub mod tx_delivery;

pub use delivery_man::TxDeliveryMan;
pub use gas::{
	create_estimator, AuctionEstimator, Eip1559Estimator, GasEstimator, GasLimitEstimator,
	GasOracle, GasOracles, StaticGasOracle,
};
pub use nonce_coordinator::{PendingNonce, TxNonceCoordinator, MAX_NONCE_ATTEMPTS};
pub use nonce_fetcher::{NonceFetcher, MIN_PROVIDERS_FOR_AGREEMENT};
pub use tx_delivery::{
	CalldataProvider, DeliveryContext, DeliveryReceipt, DeliveryRequest, DeliveryState, TxDelivery,
};

/// Errors that can occur while delivering a transaction.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error(transparent)]
	Rpc(#[from] RpcError),
	#[error(transparent)]
	Router(#[from] RouterError),
	#[error("Signing failed: {0}")]
	Signer(String),
	#[error("Gas oracle error: {0}")]
	Oracle(String),
	#[error("Calldata error: {0}")]
	Calldata(String),
	#[error("Insufficient funds: {0}")]
	InsufficientFunds(String),
	#[error("Transaction with same nonce {0} was delivered by someone else")]
	SameNonceDeliveredElsewhere(u64),
	#[error("Failed to deliver transaction after {0} attempts")]
	MaxAttempts(u32),
	/// A [`TxDelivery`] only ever delivers one transaction.
	#[error("Delivery instance was already used")]
	AlreadyUsed,
	#[error("RpcUrl={0} Delivery in progress; Skipping")]
	Busy(String),
	#[error("{}", all_failed_message(.0))]
	AllFailed(Vec<(String, DeliveryError)>),
	#[error("Network between rpcs is forked; mined transactions: {0:?}")]
	Forked(Vec<B256>),
	#[error("None of {0} transaction hashes has a receipt")]
	NoReceipt(usize),
}

fn all_failed_message(errors: &[(String, DeliveryError)]) -> String {
	let errors: Vec<String> = errors
		.iter()
		.map(|(endpoint, error)| format!("RpcUrl={} {}", endpoint, error))
		.collect();
	format!("All providers failed to deliver: [{}]", errors.join("; "))
}

impl From<AccountError> for DeliveryError {
	fn from(error: AccountError) -> Self {
		DeliveryError::Signer(error.to_string())
	}
}

#[cfg(test)]
pub(crate) mod test_utils {
	use relayer_account::implementations::local::LocalSigner;
	use relayer_account::SignerInterface;
	use relayer_types::{DeliveryOptions, NonceOptions, SecretString};
	use std::sync::Arc;

	pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	pub fn signer() -> Arc<dyn SignerInterface> {
		Arc::new(LocalSigner::new(&SecretString::from(TEST_KEY)).unwrap())
	}

	pub fn delivery_options() -> DeliveryOptions {
		DeliveryOptions {
			expected_delivery_time_ms: 1_000,
			max_attempts: 3,
			..Default::default()
		}
	}

	pub fn nonce_options(fast_mode: bool) -> NonceOptions {
		NonceOptions {
			fast_mode,
			..Default::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_all_failed_message_lists_endpoints() {
		let error = DeliveryError::AllFailed(vec![
			("a".into(), DeliveryError::MaxAttempts(3)),
			("b".into(), DeliveryError::Busy("b".into())),
		]);
		assert_eq!(
			error.to_string(),
			"All providers failed to deliver: [RpcUrl=a Failed to deliver transaction after 3 attempts; RpcUrl=b RpcUrl=b Delivery in progress; Skipping]"
		);
	}

	#[test]
	fn test_same_nonce_message() {
		assert_eq!(
			DeliveryError::SameNonceDeliveredElsewhere(4).to_string(),
			"Transaction with same nonce 4 was delivered by someone else"
		);
	}
}
