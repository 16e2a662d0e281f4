//! Fee and gas limit estimation for delivery attempts.
//!
//! A [`GasEstimator`] produces the fee structure of each broadcast attempt.
//! Attempt numbers start at 0; every later attempt replaces the previous
//! transaction and must outbid it, which the estimators guarantee through
//! [`GasEstimator::scale_fees`].

use crate::DeliveryError;
use async_trait::async_trait;
use relayer_rpc::EndpointInterface;
use relayer_types::{DeliveryOptions, FeeMarket, FeeStructure};
use std::sync::Arc;

pub mod auction;
pub mod eip1559;
pub mod gas_limit;
pub mod oracle;

pub use auction::AuctionEstimator;
pub use eip1559::Eip1559Estimator;
pub use gas_limit::GasLimitEstimator;
pub use oracle::{GasOracle, GasOracles, StaticGasOracle};

/// Fee estimation for one fee market.
///
/// Estimators are stateful: scaling remembers the fees of the previous
/// attempt so a replacement is never underpriced. Use one estimator per
/// delivered transaction.
#[async_trait]
pub trait GasEstimator: Send + Sync {
	/// Fetches unscaled fees for `attempt` from the chain.
	async fn get_fees(
		&self,
		endpoint: &dyn EndpointInterface,
		attempt: u32,
	) -> Result<FeeStructure, DeliveryError>;

	/// Applies the attempt multiplier and the replacement floor to `fees`.
	///
	/// Attempt 0 starts a new transaction and forgets earlier attempts.
	fn scale_fees(&self, fees: FeeStructure, attempt: u32) -> FeeStructure;

	/// Fees for the first broadcast.
	async fn estimate_initial(
		&self,
		endpoint: &dyn EndpointInterface,
	) -> Result<FeeStructure, DeliveryError> {
		self.estimate(endpoint, 0).await
	}

	/// Fees for `attempt`, fetched and scaled.
	async fn estimate(
		&self,
		endpoint: &dyn EndpointInterface,
		attempt: u32,
	) -> Result<FeeStructure, DeliveryError> {
		let fees = self.get_fees(endpoint, attempt).await?;
		Ok(self.scale_fees(fees, attempt))
	}
}

/// Creates the estimator matching the configured fee market.
pub fn create_estimator(options: &DeliveryOptions) -> Arc<dyn GasEstimator> {
	match options.fee_market {
		FeeMarket::Eip1559 => Arc::new(Eip1559Estimator::new(options)),
		FeeMarket::Auction => Arc::new(AuctionEstimator::new(options)),
	}
}
