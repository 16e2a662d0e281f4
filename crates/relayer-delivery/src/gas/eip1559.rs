//! EIP-1559 fee estimation from fee history.
//!
//! The priority fee comes from `eth_feeHistory` rewards at the percentile
//! configured for the attempt. The max fee covers twice the latest base fee
//! plus the priority fee, which survives six consecutive full blocks.

use super::GasEstimator;
use crate::DeliveryError;
use async_trait::async_trait;
use relayer_rpc::EndpointInterface;
use relayer_types::{
	utils::{ceil_mul, median_ceil, pow_scale},
	BlockTag, DeliveryOptions, Eip1559Fee, FeeStructure, RewardAggregation,
};
use std::sync::{Mutex, MutexGuard};

/// Multiple of the latest base fee reserved in the max fee.
pub const BASE_FEE_MULTIPLIER: u128 = 2;

#[derive(Debug)]
struct Eip1559State {
	/// Last usable priority fee, kept across attempts.
	priority_fee: u128,
	previous: Option<Eip1559Fee>,
}

/// Fee estimator for EIP-1559 chains.
#[derive(Debug)]
pub struct Eip1559Estimator {
	percentiles: Vec<f64>,
	multiplier: f64,
	block_count: u64,
	newest_block: BlockTag,
	aggregation: RewardAggregation,
	threshold: u128,
	fallback_to_max_priority_fee: bool,
	state: Mutex<Eip1559State>,
}

impl Eip1559Estimator {
	pub fn new(options: &DeliveryOptions) -> Self {
		let percentiles = if options.percentiles.is_empty() {
			vec![75.0]
		} else {
			options.percentiles.clone()
		};
		Self {
			percentiles,
			multiplier: options.multiplier,
			block_count: options.number_of_blocks_for_fee_history,
			newest_block: options.newest_block_for_fee_history,
			aggregation: options.reward_aggregation,
			threshold: u128::from(options.priority_fee_threshold),
			fallback_to_max_priority_fee: options.fallback_to_max_priority_fee,
			state: Mutex::new(Eip1559State {
				priority_fee: u128::from(options.default_priority_fee),
				previous: None,
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Eip1559State> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Percentile used for `attempt`; the last one repeats once exhausted.
	pub fn percentile(&self, attempt: u32) -> f64 {
		let index = (attempt as usize).min(self.percentiles.len() - 1);
		self.percentiles[index]
	}

	async fn reward(&self, endpoint: &dyn EndpointInterface, attempt: u32) -> Option<u128> {
		let percentile = self.percentile(attempt);
		match endpoint
			.get_fee_history(self.block_count, self.newest_block, &[percentile])
			.await
		{
			Ok(history) => {
				let rewards: Vec<u128> = history
					.reward
					.iter()
					.filter_map(|row| row.first().copied())
					.collect();
				let aggregated = match self.aggregation {
					RewardAggregation::Max => rewards.iter().copied().max(),
					RewardAggregation::Median => median_ceil(&rewards),
				};
				aggregated.filter(|reward| *reward > self.threshold)
			},
			Err(error) => {
				tracing::warn!(error = %error, percentile = percentile, "Fee history unavailable");
				None
			},
		}
	}
}

#[async_trait]
impl GasEstimator for Eip1559Estimator {
	async fn get_fees(
		&self,
		endpoint: &dyn EndpointInterface,
		attempt: u32,
	) -> Result<FeeStructure, DeliveryError> {
		let block = endpoint.get_block(BlockTag::Latest).await?;
		let base_fee = block
			.and_then(|block| block.base_fee_per_gas)
			.ok_or_else(|| DeliveryError::Config("Chain does not report a base fee".to_string()))?;

		let mut reward = self.reward(endpoint, attempt).await;
		if reward.is_none() && self.fallback_to_max_priority_fee {
			match endpoint.get_max_priority_fee_per_gas().await {
				Ok(fee) if fee > 0 => reward = Some(fee),
				Ok(_) => {},
				Err(error) => {
					tracing::warn!(error = %error, "eth_maxPriorityFeePerGas unavailable");
				},
			}
		}

		let priority_fee = {
			let mut state = self.lock();
			if let Some(reward) = reward {
				state.priority_fee = reward;
			}
			state.priority_fee
		};
		let max_fee = base_fee
			.saturating_mul(BASE_FEE_MULTIPLIER)
			.saturating_add(priority_fee);

		tracing::debug!(
			attempt = attempt,
			base_fee = base_fee,
			priority_fee = priority_fee,
			max_fee = max_fee,
			"Estimated EIP-1559 fees"
		);
		Ok(FeeStructure::eip1559(max_fee, priority_fee))
	}

	fn scale_fees(&self, fees: FeeStructure, attempt: u32) -> FeeStructure {
		let FeeStructure::Eip1559(current) = fees else {
			return fees;
		};

		let mut state = self.lock();
		if attempt == 0 {
			state.previous = None;
		}

		// Percentiles rise on their own; the multiplier takes over once they run out.
		let exponent = if self.percentiles.len() == 1 {
			attempt
		} else {
			attempt.saturating_sub(self.percentiles.len() as u32 - 1)
		};
		let mut priority = pow_scale(current.max_priority_fee_per_gas, self.multiplier, exponent);
		let scaled_max = pow_scale(current.max_fee_per_gas, self.multiplier, exponent);

		let mut max_fee = scaled_max.max(
			current
				.max_fee_per_gas
				.saturating_add(priority.saturating_sub(current.max_priority_fee_per_gas)),
		);
		if let Some(previous) = state.previous {
			priority = priority.max(ceil_mul(previous.max_priority_fee_per_gas, 101, 100));
			max_fee = max_fee.max(ceil_mul(previous.max_fee_per_gas, 101, 100));
		}
		max_fee = max_fee.max(priority);

		let scaled = Eip1559Fee {
			max_fee_per_gas: max_fee,
			max_priority_fee_per_gas: priority,
		};
		state.previous = Some(scaled);
		FeeStructure::Eip1559(scaled)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relayer_rpc::testing::MockEndpoint;
	use relayer_rpc::RpcError;
	use relayer_types::FeeHistory;

	const GWEI: u128 = 1_000_000_000;

	fn options(multiplier: f64, percentiles: Vec<f64>) -> DeliveryOptions {
		DeliveryOptions {
			multiplier,
			percentiles,
			..Default::default()
		}
	}

	fn history(rewards: &[u128]) -> FeeHistory {
		FeeHistory {
			oldest_block: 1,
			base_fee_per_gas: vec![GWEI; rewards.len() + 1],
			reward: rewards.iter().map(|r| vec![*r]).collect(),
		}
	}

	fn max_fee(fees: FeeStructure) -> u128 {
		match fees {
			FeeStructure::Eip1559(fee) => fee.max_fee_per_gas,
			FeeStructure::Auction(_) => panic!("unexpected auction fees"),
		}
	}

	fn priority(fees: FeeStructure) -> u128 {
		match fees {
			FeeStructure::Eip1559(fee) => fee.max_priority_fee_per_gas,
			FeeStructure::Auction(_) => panic!("unexpected auction fees"),
		}
	}

	#[test]
	fn test_multiplier_applies_per_attempt() {
		let estimator = Eip1559Estimator::new(&options(2.0, vec![75.0]));
		let fees = FeeStructure::eip1559(3, 1);

		let scaled: Vec<u128> = (0..5)
			.map(|attempt| max_fee(estimator.scale_fees(fees, attempt)))
			.collect();
		assert_eq!(scaled, vec![3, 6, 12, 24, 48]);
	}

	#[test]
	fn test_replacement_outbids_previous_attempt() {
		let estimator = Eip1559Estimator::new(&options(1.001, vec![75.0]));
		let fees = FeeStructure::eip1559(30 * GWEI, GWEI);

		let mut previous = estimator.scale_fees(fees, 0);
		for attempt in 1..6 {
			let next = estimator.scale_fees(fees, attempt);
			assert!(priority(next) >= ceil_mul(priority(previous), 101, 100));
			assert!(max_fee(next) >= ceil_mul(max_fee(previous), 101, 100));
			assert!(max_fee(next) >= priority(next));
			previous = next;
		}
	}

	#[test]
	fn test_multiplier_waits_for_percentiles() {
		let estimator = Eip1559Estimator::new(&options(2.0, vec![50.0, 75.0, 90.0]));
		assert_eq!(estimator.percentile(0), 50.0);
		assert_eq!(estimator.percentile(2), 90.0);
		assert_eq!(estimator.percentile(7), 90.0);

		let fees = FeeStructure::eip1559(100, 10);
		assert_eq!(max_fee(estimator.scale_fees(fees, 0)), 100);
		assert_eq!(max_fee(estimator.scale_fees(fees, 2)), 101);
		assert_eq!(max_fee(estimator.scale_fees(fees, 3)), 200);
	}

	#[tokio::test]
	async fn test_fees_from_history() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.fee_history.set(history(&[2 * GWEI, 3 * GWEI])));

		let estimator = Eip1559Estimator::new(&DeliveryOptions::default());
		let fees = estimator.get_fees(&*mock, 0).await.unwrap();
		assert_eq!(fees, FeeStructure::eip1559(5 * GWEI, 3 * GWEI));

		let estimator = Eip1559Estimator::new(&DeliveryOptions {
			reward_aggregation: RewardAggregation::Median,
			..Default::default()
		});
		let fees = estimator.get_fees(&*mock, 0).await.unwrap();
		assert_eq!(priority(fees), 2_500_000_000);
	}

	#[tokio::test]
	async fn test_low_rewards_fall_back_to_node_suggestion() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| {
			s.fee_history.set(history(&[0, 0]));
			s.max_priority_fee.set(1_500_000_000);
		});

		let estimator = Eip1559Estimator::new(&DeliveryOptions::default());
		let fees = estimator.get_fees(&*mock, 0).await.unwrap();
		assert_eq!(priority(fees), 1_500_000_000);
		assert_eq!(mock.calls("get_max_priority_fee_per_gas"), 1);
	}

	#[tokio::test]
	async fn test_default_priority_fee_when_nothing_usable() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| {
			s.fee_history.fail(RpcError::Transport("timeout".into()));
			s.max_priority_fee.fail(RpcError::Rpc {
				code: -32601,
				message: "method not found".into(),
			});
		});

		let estimator = Eip1559Estimator::new(&DeliveryOptions::default());
		let fees = estimator.get_fees(&*mock, 0).await.unwrap();
		assert_eq!(fees, FeeStructure::eip1559(3 * GWEI, GWEI));
	}

	#[tokio::test]
	async fn test_missing_base_fee_is_an_error() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.base_fee = None);

		let estimator = Eip1559Estimator::new(&DeliveryOptions::default());
		assert!(estimator.get_fees(&*mock, 0).await.is_err());
	}
}
