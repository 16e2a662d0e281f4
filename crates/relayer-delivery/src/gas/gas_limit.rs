//! Gas limit per delivery attempt.

use crate::DeliveryError;
use relayer_rpc::EndpointInterface;
use relayer_types::{utils::pow_scale, CallRequest, DeliveryOptions};

/// Picks the gas limit of each attempt.
///
/// Uses the configured limit when there is one and `eth_estimateGas`
/// otherwise. On chains with two dimensional fees the L1 data cost shows up
/// in the gas limit, so it grows by the gas limit multiplier per attempt.
#[derive(Debug, Clone)]
pub struct GasLimitEstimator {
	fixed: Option<u64>,
	two_dimensional: bool,
	multiplier: f64,
}

impl GasLimitEstimator {
	pub fn new(options: &DeliveryOptions) -> Self {
		Self {
			fixed: options.gas_limit,
			two_dimensional: options.two_dimensional_fees,
			multiplier: options.gas_limit_multiplier,
		}
	}

	pub async fn estimate(
		&self,
		endpoint: &dyn EndpointInterface,
		request: &CallRequest,
		attempt: u32,
	) -> Result<u64, DeliveryError> {
		let base = match self.fixed {
			Some(limit) => limit,
			None => endpoint.estimate_gas(request).await?,
		};
		if !self.two_dimensional {
			return Ok(base);
		}
		let scaled = pow_scale(u128::from(base), self.multiplier, attempt);
		Ok(u64::try_from(scaled).unwrap_or(u64::MAX))
	}
}
