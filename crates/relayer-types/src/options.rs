//! Tunable options for routers, nonce handling and delivery.
//!
//! All durations are stored as milliseconds so the structures map one to one
//! onto the TOML configuration; accessor methods return [`Duration`] values.

use crate::{BlockTag, FeeMarket, RpcErrorKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options of the fallback router.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FallbackOptions {
	/// Deadline for one call on one endpoint.
	#[serde(default = "default_single_endpoint_timeout_ms")]
	pub single_endpoint_timeout_ms: u64,
	/// Deadline for one operation across every retry.
	#[serde(default = "default_all_endpoints_timeout_ms")]
	pub all_endpoints_timeout_ms: u64,
	/// Error kinds that are surfaced immediately instead of failing over.
	#[serde(default = "default_unrecoverable_errors")]
	pub unrecoverable_errors: Vec<RpcErrorKind>,
}

fn default_single_endpoint_timeout_ms() -> u64 {
	7_000
}

fn default_all_endpoints_timeout_ms() -> u64 {
	36_000
}

fn default_unrecoverable_errors() -> Vec<RpcErrorKind> {
	vec![
		RpcErrorKind::InvalidArgument,
		RpcErrorKind::NonceExpired,
		RpcErrorKind::ReplacementUnderpriced,
		RpcErrorKind::ExecutionReverted,
	]
}

impl Default for FallbackOptions {
	fn default() -> Self {
		Self {
			single_endpoint_timeout_ms: default_single_endpoint_timeout_ms(),
			all_endpoints_timeout_ms: default_all_endpoints_timeout_ms(),
			unrecoverable_errors: default_unrecoverable_errors(),
		}
	}
}

impl FallbackOptions {
	pub fn single_endpoint_timeout(&self) -> Duration {
		Duration::from_millis(self.single_endpoint_timeout_ms)
	}

	pub fn all_endpoints_timeout(&self) -> Duration {
		Duration::from_millis(self.all_endpoints_timeout_ms)
	}

	/// Returns true if errors of this kind must not trigger a failover.
	pub fn is_unrecoverable(&self, kind: RpcErrorKind) -> bool {
		self.unrecoverable_errors.contains(&kind)
	}
}

/// Options of the curated endpoint list used by the agreement router.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CuratedListOptions {
	#[serde(default = "default_evaluation_interval_ms")]
	pub evaluation_interval_ms: u64,
	#[serde(default = "default_reset_quarantine_interval_ms")]
	pub reset_quarantine_interval_ms: u64,
	/// Error rate above which an endpoint is quarantined, between 0 and 1.
	#[serde(default = "default_max_error_rate")]
	pub max_error_rate: f64,
	/// Minimum number of endpoints kept out of quarantine. Defaults to quorum + 1.
	#[serde(default)]
	pub minimal_providers_count: Option<usize>,
}

fn default_evaluation_interval_ms() -> u64 {
	30_000
}

fn default_reset_quarantine_interval_ms() -> u64 {
	60_000
}

fn default_max_error_rate() -> f64 {
	0.15
}

impl Default for CuratedListOptions {
	fn default() -> Self {
		Self {
			evaluation_interval_ms: default_evaluation_interval_ms(),
			reset_quarantine_interval_ms: default_reset_quarantine_interval_ms(),
			max_error_rate: default_max_error_rate(),
			minimal_providers_count: None,
		}
	}
}

/// Options of the agreement router.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgreementOptions {
	/// Number of endpoints that have to return the same result.
	#[serde(default = "default_quorum")]
	pub quorum: usize,
	#[serde(default = "default_block_number_timeout_ms")]
	pub block_number_timeout_ms: u64,
	/// How long an elected block number is reused.
	#[serde(default = "default_block_number_cache_ttl_ms")]
	pub block_number_cache_ttl_ms: u64,
	/// Pause between block number polls while an endpoint catches up.
	#[serde(default = "default_sleep_between_block_sync_ms")]
	pub sleep_between_block_sync_ms: u64,
	/// How long an agreed call result is reused for an identical request.
	#[serde(default = "default_call_cache_ttl_ms")]
	pub call_cache_ttl_ms: u64,
	/// Reject quorum reads that do not pin a block explicitly.
	#[serde(default)]
	pub require_explicit_block_tag: bool,
	/// Return the most voted result instead of failing when quorum is not reached.
	#[serde(default)]
	pub ignore_agreement_on_insufficient_responses: bool,
	/// Successful responses needed before a failed agreement reports the result map.
	#[serde(default = "default_minimal_providers_count")]
	pub minimal_providers_count: usize,
	/// Average block time used by block number sanity checks.
	#[serde(default = "default_agreement_avg_block_time_ms")]
	pub avg_block_time_ms: u64,
	#[serde(default)]
	pub curated_list: Option<CuratedListOptions>,
}

fn default_quorum() -> usize {
	2
}

fn default_block_number_timeout_ms() -> u64 {
	1_500
}

fn default_block_number_cache_ttl_ms() -> u64 {
	50
}

fn default_sleep_between_block_sync_ms() -> u64 {
	500
}

fn default_call_cache_ttl_ms() -> u64 {
	1_000
}

fn default_minimal_providers_count() -> usize {
	3
}

fn default_agreement_avg_block_time_ms() -> u64 {
	12_000
}

impl Default for AgreementOptions {
	fn default() -> Self {
		Self {
			quorum: default_quorum(),
			block_number_timeout_ms: default_block_number_timeout_ms(),
			block_number_cache_ttl_ms: default_block_number_cache_ttl_ms(),
			sleep_between_block_sync_ms: default_sleep_between_block_sync_ms(),
			call_cache_ttl_ms: default_call_cache_ttl_ms(),
			require_explicit_block_tag: false,
			ignore_agreement_on_insufficient_responses: false,
			minimal_providers_count: default_minimal_providers_count(),
			avg_block_time_ms: default_agreement_avg_block_time_ms(),
			curated_list: None,
		}
	}
}

impl AgreementOptions {
	pub fn block_number_timeout(&self) -> Duration {
		Duration::from_millis(self.block_number_timeout_ms)
	}

	pub fn block_number_cache_ttl(&self) -> Duration {
		Duration::from_millis(self.block_number_cache_ttl_ms)
	}

	pub fn sleep_between_block_sync(&self) -> Duration {
		Duration::from_millis(self.sleep_between_block_sync_ms)
	}

	pub fn call_cache_ttl(&self) -> Duration {
		Duration::from_millis(self.call_cache_ttl_ms)
	}
}

/// Options of nonce fetching and coordination.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NonceOptions {
	/// Track nonces locally instead of asking the chain for every transaction.
	#[serde(default)]
	pub fast_mode: bool,
	#[serde(default = "default_single_nonce_timeout_ms")]
	pub single_call_timeout_ms: u64,
	/// Agreement quorum used once enough endpoints are configured.
	#[serde(default = "default_quorum")]
	pub quorum: usize,
	/// Age after which an unmined pending nonce is released.
	#[serde(default = "default_stale_threshold_ms")]
	pub stale_threshold_ms: u64,
	#[serde(default = "default_reconcile_interval_ms")]
	pub reconcile_interval_ms: u64,
	#[serde(default = "default_max_pending_per_tick")]
	pub max_pending_per_tick: usize,
	#[serde(default = "default_max_pending_tracked")]
	pub max_pending_tracked: usize,
}

fn default_single_nonce_timeout_ms() -> u64 {
	5_000
}

fn default_stale_threshold_ms() -> u64 {
	10_000
}

fn default_reconcile_interval_ms() -> u64 {
	500
}

fn default_max_pending_per_tick() -> usize {
	100
}

fn default_max_pending_tracked() -> usize {
	1_000
}

impl Default for NonceOptions {
	fn default() -> Self {
		Self {
			fast_mode: false,
			single_call_timeout_ms: default_single_nonce_timeout_ms(),
			quorum: default_quorum(),
			stale_threshold_ms: default_stale_threshold_ms(),
			reconcile_interval_ms: default_reconcile_interval_ms(),
			max_pending_per_tick: default_max_pending_per_tick(),
			max_pending_tracked: default_max_pending_tracked(),
		}
	}
}

impl NonceOptions {
	pub fn single_call_timeout(&self) -> Duration {
		Duration::from_millis(self.single_call_timeout_ms)
	}

	pub fn stale_threshold(&self) -> Duration {
		Duration::from_millis(self.stale_threshold_ms)
	}

	pub fn reconcile_interval(&self) -> Duration {
		Duration::from_millis(self.reconcile_interval_ms)
	}
}

/// How per-block priority fee rewards are folded into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardAggregation {
	#[default]
	Max,
	/// Median rounded up.
	Median,
}

/// Options of a delivery.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeliveryOptions {
	/// Time to wait after a broadcast before checking the account nonce.
	/// Roughly the block time plus propagation, e.g. 14 000 for 12 s blocks.
	#[serde(default = "default_expected_delivery_time_ms")]
	pub expected_delivery_time_ms: u64,
	/// Fixed gas limit; estimated per attempt when absent.
	#[serde(default)]
	pub gas_limit: Option<u64>,
	/// Chain charges for L1 data as well as L2 execution.
	#[serde(default)]
	pub two_dimensional_fees: bool,
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	/// Fee multiplier applied per attempt once percentiles are exhausted.
	#[serde(default = "default_multiplier")]
	pub multiplier: f64,
	#[serde(default = "default_gas_limit_multiplier")]
	pub gas_limit_multiplier: f64,
	/// Ascending fee history percentiles, one per attempt.
	#[serde(default = "default_percentiles")]
	pub percentiles: Vec<f64>,
	#[serde(default = "default_number_of_blocks_for_fee_history")]
	pub number_of_blocks_for_fee_history: u64,
	#[serde(default = "default_newest_block_for_fee_history")]
	pub newest_block_for_fee_history: BlockTag,
	#[serde(default)]
	pub reward_aggregation: RewardAggregation,
	/// Aggregated rewards at or below this value are treated as missing.
	#[serde(default)]
	pub priority_fee_threshold: u64,
	/// Ask `eth_maxPriorityFeePerGas` when fee history gives no usable reward.
	#[serde(default = "default_true")]
	pub fallback_to_max_priority_fee: bool,
	/// Priority fee used until the first successful estimate.
	#[serde(default = "default_priority_fee")]
	pub default_priority_fee: u64,
	#[serde(default)]
	pub fee_market: FeeMarket,
	#[serde(default = "default_gas_oracle_timeout_ms")]
	pub gas_oracle_timeout_ms: u64,
	#[serde(default)]
	pub force_disable_custom_gas_oracle: bool,
}

fn default_expected_delivery_time_ms() -> u64 {
	14_000
}

fn default_max_attempts() -> u32 {
	10
}

fn default_multiplier() -> f64 {
	1.125
}

fn default_gas_limit_multiplier() -> f64 {
	1.1
}

fn default_percentiles() -> Vec<f64> {
	vec![75.0]
}

fn default_number_of_blocks_for_fee_history() -> u64 {
	2
}

fn default_newest_block_for_fee_history() -> BlockTag {
	BlockTag::Pending
}

fn default_true() -> bool {
	true
}

fn default_priority_fee() -> u64 {
	1_000_000_000
}

fn default_gas_oracle_timeout_ms() -> u64 {
	5_000
}

impl Default for DeliveryOptions {
	fn default() -> Self {
		Self {
			expected_delivery_time_ms: default_expected_delivery_time_ms(),
			gas_limit: None,
			two_dimensional_fees: false,
			max_attempts: default_max_attempts(),
			multiplier: default_multiplier(),
			gas_limit_multiplier: default_gas_limit_multiplier(),
			percentiles: default_percentiles(),
			number_of_blocks_for_fee_history: default_number_of_blocks_for_fee_history(),
			newest_block_for_fee_history: default_newest_block_for_fee_history(),
			reward_aggregation: RewardAggregation::default(),
			priority_fee_threshold: 0,
			fallback_to_max_priority_fee: true,
			default_priority_fee: default_priority_fee(),
			fee_market: FeeMarket::default(),
			gas_oracle_timeout_ms: default_gas_oracle_timeout_ms(),
			force_disable_custom_gas_oracle: false,
		}
	}
}

impl DeliveryOptions {
	pub fn expected_delivery_time(&self) -> Duration {
		Duration::from_millis(self.expected_delivery_time_ms)
	}

	pub fn gas_oracle_timeout(&self) -> Duration {
		Duration::from_millis(self.gas_oracle_timeout_ms)
	}

	/// Checks value ranges that serde defaults cannot express.
	pub fn validate(&self) -> Result<(), String> {
		if self.max_attempts == 0 {
			return Err("max_attempts must be at least 1".into());
		}
		if self.multiplier < 1.0 {
			return Err(format!("multiplier must be >= 1, got {}", self.multiplier));
		}
		if self.gas_limit_multiplier < 1.0 {
			return Err(format!(
				"gas_limit_multiplier must be >= 1, got {}",
				self.gas_limit_multiplier
			));
		}
		if self.percentiles.is_empty() {
			return Err("percentiles cannot be empty".into());
		}
		if self.percentiles.iter().any(|p| !(0.0..=100.0).contains(p)) {
			return Err("percentiles must be between 0 and 100".into());
		}
		if self.percentiles.windows(2).any(|w| w[0] > w[1]) {
			return Err("percentiles must be ascending".into());
		}
		if self.number_of_blocks_for_fee_history == 0 {
			return Err("number_of_blocks_for_fee_history must be at least 1".into());
		}
		Ok(())
	}
}
