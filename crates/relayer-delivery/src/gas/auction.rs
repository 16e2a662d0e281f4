//! Gas price estimation for chains without a base fee.

use super::GasEstimator;
use crate::DeliveryError;
use async_trait::async_trait;
use relayer_rpc::EndpointInterface;
use relayer_types::{utils::pow_scale, DeliveryOptions, FeeStructure};
use std::sync::Mutex;

/// Fee estimator for single gas price auctions.
#[derive(Debug)]
pub struct AuctionEstimator {
	multiplier: f64,
	previous: Mutex<Option<u128>>,
}

impl AuctionEstimator {
	pub fn new(options: &DeliveryOptions) -> Self {
		Self {
			multiplier: options.multiplier,
			previous: Mutex::new(None),
		}
	}
}

#[async_trait]
impl GasEstimator for AuctionEstimator {
	async fn get_fees(
		&self,
		endpoint: &dyn EndpointInterface,
		attempt: u32,
	) -> Result<FeeStructure, DeliveryError> {
		let gas_price = endpoint.get_gas_price().await?;
		tracing::debug!(attempt = attempt, gas_price = gas_price, "Fetched gas price");
		Ok(FeeStructure::auction(gas_price))
	}

	fn scale_fees(&self, fees: FeeStructure, attempt: u32) -> FeeStructure {
		let FeeStructure::Auction(current) = fees else {
			return fees;
		};

		let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
		if attempt == 0 {
			*previous = None;
		}
		let mut gas_price = pow_scale(current.gas_price, self.multiplier, attempt);
		if let Some(floor) = *previous {
			gas_price = gas_price.max(floor);
		}
		*previous = Some(gas_price);
		FeeStructure::auction(gas_price)
	}
}
