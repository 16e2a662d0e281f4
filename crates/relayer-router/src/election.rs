//! Block number election and per-endpoint block sanity checks.

use dashmap::DashMap;
use relayer_rpc::RpcError;
use relayer_types::rounded_median;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Function reducing the block numbers reported by endpoints to one number.
pub type ElectionFn = Arc<dyn Fn(&[u64]) -> Option<u64> + Send + Sync>;

/// An endpoint whose block number has not moved for this long is stale.
pub const STALE_BLOCK_THRESHOLD: Duration = Duration::from_secs(180);

/// Largest jump ahead of the previous observation that is still plausible.
pub const MAX_BLOCK_LEAP: Duration = Duration::from_secs(72 * 60 * 60);

/// Default election: the median, with an even count rounding the average of
/// the two middle values half up.
pub fn elect_rounded_median(block_numbers: &[u64]) -> Option<u64> {
	rounded_median(block_numbers)
}

/// A cached election result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectedBlock {
	pub value: u64,
	pub elected_at: Instant,
}

impl ElectedBlock {
	pub fn new(value: u64) -> Self {
		Self {
			value,
			elected_at: Instant::now(),
		}
	}

	pub fn is_fresh(&self, ttl: Duration) -> bool {
		self.elected_at.elapsed() < ttl
	}
}

#[derive(Debug, Clone, Copy)]
struct TrackedBlock {
	number: u64,
	changed_at: Instant,
}

/// Remembers the last block number each endpoint reported.
#[derive(Debug)]
pub struct BlockTracker {
	blocks: DashMap<String, TrackedBlock>,
	avg_block_time: Duration,
}

impl BlockTracker {
	pub fn new(avg_block_time: Duration) -> Self {
		Self {
			blocks: DashMap::new(),
			avg_block_time,
		}
	}

	/// Checks a freshly polled block number and records it.
	///
	/// # Errors
	///
	/// Rejects zero, a number lower than the endpoint's previous one, and a
	/// number further ahead of the previous one than [`MAX_BLOCK_LEAP`] worth
	/// of blocks.
	pub fn observe(&self, endpoint: &str, number: u64) -> Result<(), RpcError> {
		if number == 0 {
			return Err(RpcError::InvalidResponse(
				"Block number must be greater than 0".to_string(),
			));
		}

		let now = Instant::now();
		let mut entry = self.blocks.entry(endpoint.to_string()).or_insert(TrackedBlock {
			number,
			changed_at: now,
		});
		let previous = entry.number;
		if number < previous {
			return Err(RpcError::InvalidResponse(format!(
				"Block number {} is lower than previously observed {}",
				number, previous
			)));
		}
		let leap = self
			.avg_block_time
			.saturating_mul(u32::try_from(number - previous).unwrap_or(u32::MAX));
		if leap > MAX_BLOCK_LEAP {
			return Err(RpcError::InvalidResponse(format!(
				"Block number {} is too far ahead of previously observed {}",
				number, previous
			)));
		}
		if number > previous {
			*entry = TrackedBlock {
				number,
				changed_at: now,
			};
		}
		Ok(())
	}

	/// Returns true if the endpoint's block number has not changed for
	/// [`STALE_BLOCK_THRESHOLD`].
	pub fn is_stale(&self, endpoint: &str) -> bool {
		self.blocks
			.get(endpoint)
			.is_some_and(|tracked| tracked.changed_at.elapsed() >= STALE_BLOCK_THRESHOLD)
	}

	pub fn last(&self, endpoint: &str) -> Option<u64> {
		self.blocks.get(endpoint).map(|tracked| tracked.number)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_median_election() {
		assert_eq!(elect_rounded_median(&[1, 2, 2]), Some(2));
		assert_eq!(elect_rounded_median(&[3, 4, 1]), Some(3));
		assert_eq!(elect_rounded_median(&[100, 100, 98]), Some(100));
		assert_eq!(elect_rounded_median(&[]), None);
	}

	#[test]
	fn test_sanity_checks() {
		let tracker = BlockTracker::new(Duration::from_secs(12));
		assert!(tracker.observe("a", 0).is_err());
		assert!(tracker.observe("a", 100).is_ok());
		assert!(tracker.observe("a", 99).is_err());
		assert!(tracker.observe("a", 100).is_ok());
		// 72h of 12s blocks is 21 600 blocks.
		assert!(tracker.observe("a", 100 + 21_600).is_ok());
		assert!(tracker.observe("a", 100 + 21_600 + 21_601).is_err());
		assert_eq!(tracker.last("a"), Some(21_700));
	}

	#[tokio::test(start_paused = true)]
	async fn test_unchanged_block_becomes_stale() {
		let tracker = BlockTracker::new(Duration::from_secs(12));
		tracker.observe("a", 10).unwrap();
		tracker.observe("b", 10).unwrap();

		tokio::time::advance(Duration::from_secs(120)).await;
		tracker.observe("a", 10).unwrap();
		tracker.observe("b", 11).unwrap();

		tokio::time::advance(Duration::from_secs(60)).await;
		assert!(tracker.is_stale("a"));
		assert!(!tracker.is_stale("b"));
		assert!(!tracker.is_stale("unknown"));
	}
}
