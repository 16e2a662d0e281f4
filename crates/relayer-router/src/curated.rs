//! Curated endpoint list.
//!
//! Scores every endpoint by its error rate. Endpoints above the configured
//! error rate are quarantined at each evaluation and released one at a time
//! afterwards. The list never reports fewer healthy endpoints than its
//! minimum, releasing quarantined ones early when it has to.

use relayer_types::CuratedListOptions;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct EndpointScore {
	calls: u64,
	errors: u64,
	quarantined: bool,
	/// How often this endpoint has been quarantined.
	quarantine_count: u32,
}

#[derive(Debug)]
struct CuratedState {
	scores: HashMap<String, EndpointScore>,
	last_evaluation: Instant,
	last_release: Instant,
}

/// Error-rate based selection of the endpoints that take part in agreement.
#[derive(Debug)]
pub struct CuratedRpcList {
	labels: Vec<String>,
	minimal: usize,
	max_error_rate: f64,
	evaluation_interval: Duration,
	release_interval: Duration,
	state: Mutex<CuratedState>,
}

impl CuratedRpcList {
	/// Creates a list over `labels`.
	///
	/// `minimal_providers_count` defaults to `quorum + 1`, capped at the
	/// number of endpoints.
	pub fn new(labels: Vec<String>, options: &CuratedListOptions, quorum: usize) -> Self {
		let minimal = options
			.minimal_providers_count
			.unwrap_or(quorum + 1)
			.min(labels.len());
		let now = Instant::now();
		Self {
			labels: labels.clone(),
			minimal,
			max_error_rate: options.max_error_rate,
			evaluation_interval: Duration::from_millis(options.evaluation_interval_ms),
			release_interval: Duration::from_millis(options.reset_quarantine_interval_ms),
			state: Mutex::new(CuratedState {
				scores: labels
					.into_iter()
					.map(|label| (label, EndpointScore::default()))
					.collect(),
				last_evaluation: now,
				last_release: now,
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, CuratedState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn minimal(&self) -> usize {
		self.minimal
	}

	/// Records the outcome of one call.
	pub fn score(&self, label: &str, success: bool) {
		if let Some(score) = self.lock().scores.get_mut(label) {
			score.calls += 1;
			if !success {
				score.errors += 1;
			}
		}
	}

	/// Quarantines endpoints whose error rate exceeds the limit and resets
	/// every counter.
	pub fn evaluate(&self) {
		let mut state = self.lock();
		self.evaluate_locked(&mut state);
		self.ensure_minimal(&mut state);
	}

	/// Releases the quarantined endpoint quarantined least often.
	pub fn release_one(&self) -> Option<String> {
		self.release_locked(&mut self.lock())
	}

	/// Endpoints currently out of quarantine, in configuration order.
	///
	/// Runs any evaluation or release that is due first.
	pub fn healthy(&self) -> Vec<String> {
		let mut state = self.lock();
		let now = Instant::now();
		if now.duration_since(state.last_evaluation) >= self.evaluation_interval {
			self.evaluate_locked(&mut state);
			state.last_evaluation = now;
		}
		if now.duration_since(state.last_release) >= self.release_interval {
			self.release_locked(&mut state);
			state.last_release = now;
		}
		self.ensure_minimal(&mut state);

		self.labels
			.iter()
			.filter(|label| state.scores.get(*label).is_some_and(|s| !s.quarantined))
			.cloned()
			.collect()
	}

	pub fn is_quarantined(&self, label: &str) -> bool {
		self.lock()
			.scores
			.get(label)
			.is_some_and(|score| score.quarantined)
	}

	fn evaluate_locked(&self, state: &mut CuratedState) {
		for (label, score) in state.scores.iter_mut() {
			if !score.quarantined && score.calls > 0 {
				let error_rate = score.errors as f64 / score.calls as f64;
				if error_rate > self.max_error_rate {
					score.quarantined = true;
					score.quarantine_count += 1;
					tracing::warn!(
						endpoint = %label,
						error_rate = error_rate,
						quarantine_count = score.quarantine_count,
						"Quarantining endpoint"
					);
				}
			}
			score.calls = 0;
			score.errors = 0;
		}
	}

	fn release_locked(&self, state: &mut CuratedState) -> Option<String> {
		let label = self
			.labels
			.iter()
			.filter_map(|label| {
				state
					.scores
					.get(label)
					.filter(|score| score.quarantined)
					.map(|score| (label, score.quarantine_count))
			})
			.min_by_key(|(_, count)| *count)
			.map(|(label, _)| label.clone())?;

		if let Some(score) = state.scores.get_mut(&label) {
			score.quarantined = false;
		}
		tracing::info!(endpoint = %label, "Releasing endpoint from quarantine");
		Some(label)
	}

	fn ensure_minimal(&self, state: &mut CuratedState) {
		loop {
			let healthy = state.scores.values().filter(|s| !s.quarantined).count();
			if healthy >= self.minimal || self.release_locked(state).is_none() {
				break;
			}
		}
	}
}
