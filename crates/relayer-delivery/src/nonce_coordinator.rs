//! Nonce allocation for one sender account.
//!
//! In the default mode every allocation asks the chain for the pending nonce.
//! Fast mode keeps the next nonce in memory instead, tracks the hashes
//! broadcast for each nonce and reconciles with the chain in the background:
//! mined nonces are confirmed, nonces that stay unmined past the stale
//! threshold are handed out again.
//!
//! The coordinator assumes it is the only writer for its account. Callers
//! allocate a nonce, broadcast, then [`TxNonceCoordinator::register`] the
//! hash; concurrent senders sharing an account need external sequencing.

use crate::{DeliveryError, NonceFetcher};
use futures::future::join_all;
use relayer_rpc::with_timeout;
use relayer_types::{Address, BlockTag, NonceOptions, TransactionReceipt, B256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Most transaction hashes remembered per pending nonce.
pub const MAX_NONCE_ATTEMPTS: usize = 10;

/// A nonce that was broadcast but is not known to be mined yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNonce {
	pub nonce: u64,
	/// Hashes broadcast with this nonce, oldest first.
	pub hashes: Vec<B256>,
	pub updated_at: Instant,
	/// Broadcasts registered, capped at [`MAX_NONCE_ATTEMPTS`].
	pub attempts: usize,
}

#[derive(Debug, Default)]
struct NonceState {
	next_nonce: Option<u64>,
	/// Count of nonces known to be mined.
	confirmed: Option<u64>,
	pending: BTreeMap<u64, PendingNonce>,
}

/// Allocates nonces for a single sender.
#[derive(Debug)]
pub struct TxNonceCoordinator {
	address: Address,
	fetcher: NonceFetcher,
	options: NonceOptions,
	state: Mutex<NonceState>,
	reconciling: AtomicBool,
}

struct ReconcileGuard<'a>(&'a AtomicBool);

impl Drop for ReconcileGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl TxNonceCoordinator {
	pub fn new(address: Address, fetcher: NonceFetcher, options: NonceOptions) -> Self {
		Self {
			address,
			fetcher,
			options,
			state: Mutex::new(NonceState::default()),
			reconciling: AtomicBool::new(false),
		}
	}

	fn lock(&self) -> MutexGuard<'_, NonceState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn address(&self) -> Address {
		self.address
	}

	pub fn is_fast_mode(&self) -> bool {
		self.options.fast_mode
	}

	/// Next nonce in fast mode, once aligned with the chain.
	pub fn next_nonce(&self) -> Option<u64> {
		self.lock().next_nonce
	}

	pub fn confirmed_nonce(&self) -> Option<u64> {
		self.lock().confirmed
	}

	pub fn pending_count(&self) -> usize {
		self.lock().pending.len()
	}

	pub fn pending(&self, nonce: u64) -> Option<PendingNonce> {
		self.lock().pending.get(&nonce).cloned()
	}

	/// Reads the chain nonce, preferring the pending tag.
	pub async fn fetch_chain_nonce(&self) -> Result<u64, DeliveryError> {
		match self.fetcher.fetch(self.address, BlockTag::Pending).await {
			Ok(nonce) => Ok(nonce),
			Err(error) => {
				tracing::warn!(
					address = %self.address,
					error = %error,
					"Pending nonce unavailable, falling back to latest"
				);
				self.fetcher.fetch(self.address, BlockTag::Latest).await
			},
		}
	}

	/// Returns the nonce for the next transaction.
	///
	/// Fast mode aligns with the chain on first use and afterwards answers
	/// from memory; the value only moves once a broadcast is registered.
	/// Two concurrent callers may therefore receive the same nonce: allocate
	/// from one logical sender per coordinator.
	pub async fn allocate_nonce(&self) -> Result<u64, DeliveryError> {
		if !self.options.fast_mode {
			return self.fetch_chain_nonce().await;
		}

		let next = self.lock().next_nonce;
		if let Some(nonce) = next {
			return Ok(nonce);
		}

		let chain = self.fetch_chain_nonce().await?;
		let mut state = self.lock();
		let nonce = *state.next_nonce.get_or_insert(chain);
		tracing::debug!(address = %self.address, nonce = nonce, "Aligned nonce with chain");
		Ok(nonce)
	}

	/// Records a broadcast of `hash` with `nonce`.
	///
	/// Registering the same hash twice is a no-op. Only fast mode tracks
	/// broadcasts.
	pub fn register(&self, nonce: u64, hash: B256) {
		if !self.options.fast_mode {
			return;
		}

		let mut state = self.lock();
		let entry = state.pending.entry(nonce).or_insert_with(|| PendingNonce {
			nonce,
			hashes: Vec::new(),
			updated_at: Instant::now(),
			attempts: 0,
		});
		if entry.hashes.contains(&hash) {
			return;
		}
		if entry.hashes.len() >= MAX_NONCE_ATTEMPTS {
			entry.hashes.remove(0);
		}
		entry.hashes.push(hash);
		entry.attempts = (entry.attempts + 1).min(MAX_NONCE_ATTEMPTS);
		entry.updated_at = Instant::now();

		let next = state.next_nonce.map_or(nonce + 1, |next| next.max(nonce + 1));
		state.next_nonce = Some(next);
	}

	/// Forgets everything learned so far; the next allocation re-aligns.
	pub fn reset(&self) {
		*self.lock() = NonceState::default();
	}

	/// One reconciliation pass.
	///
	/// Returns immediately when another pass is still running.
	pub async fn reconcile(&self) -> Result<(), DeliveryError> {
		if !self.options.fast_mode || self.pending_count() == 0 {
			return Ok(());
		}
		if self.reconciling.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		let _guard = ReconcileGuard(&self.reconciling);

		let batch: Vec<PendingNonce> = {
			let mut state = self.lock();
			while state.pending.len() > self.options.max_pending_tracked {
				if let Some((nonce, _)) = state.pending.pop_first() {
					tracing::warn!(address = %self.address, nonce = nonce, "Dropping oldest pending nonce");
				}
			}
			state
				.pending
				.values()
				.take(self.options.max_pending_per_tick)
				.cloned()
				.collect()
		};

		let endpoints = self.fetcher.endpoints();
		let timeout = self.options.single_call_timeout();
		let mut checked = Vec::with_capacity(batch.len());
		for chunk in batch.chunks(endpoints.len()) {
			let results = join_all(chunk.iter().map(|pending| async move {
				let endpoint = &endpoints[(pending.nonce % endpoints.len() as u64) as usize];
				let mut mined: Option<TransactionReceipt> = None;
				for hash in pending.hashes.iter().rev() {
					match with_timeout(timeout, endpoint.get_transaction_receipt(*hash)).await {
						Ok(Some(receipt)) if receipt.block_number.is_some() => {
							mined = Some(receipt);
							break;
						},
						Ok(_) => {},
						Err(error) => {
							tracing::debug!(
								endpoint = %endpoint.label(),
								nonce = pending.nonce,
								error = %error,
								"Receipt lookup failed"
							);
						},
					}
				}
				(pending.nonce, mined)
			}))
			.await;
			checked.extend(results);
		}

		{
			let now = Instant::now();
			let stale_threshold = self.options.stale_threshold();
			let mut state = self.lock();
			for (nonce, mined) in checked {
				let Some((updated_at, attempts)) = state
					.pending
					.get(&nonce)
					.map(|entry| (entry.updated_at, entry.attempts))
				else {
					continue;
				};
				if let Some(receipt) = mined {
					tracing::debug!(
						nonce = nonce,
						tx_hash = %receipt.transaction_hash,
						"Pending nonce mined"
					);
					state.pending.remove(&nonce);
					state.confirmed = Some(state.confirmed.map_or(nonce + 1, |c| c.max(nonce + 1)));
				} else if now.duration_since(updated_at) >= stale_threshold {
					tracing::warn!(
						address = %self.address,
						nonce = nonce,
						attempts = attempts,
						"Pending nonce went stale, releasing it"
					);
					state.pending.remove(&nonce);
					state.next_nonce = Some(state.next_nonce.map_or(nonce, |next| next.min(nonce)));
				}
			}
		}

		let pending = self.fetcher.fetch(self.address, BlockTag::Pending).await;
		let latest = self.fetcher.fetch(self.address, BlockTag::Latest).await;
		let mut state = self.lock();
		if let Ok(latest) = &latest {
			state.confirmed = Some(state.confirmed.map_or(*latest, |c| c.max(*latest)));
		}
		let chain = match (pending, latest) {
			(Ok(pending), Ok(latest)) => Some(pending.max(latest)),
			(Ok(nonce), Err(_)) | (Err(_), Ok(nonce)) => Some(nonce),
			(Err(error), Err(_)) => {
				tracing::warn!(address = %self.address, error = %error, "Nonce re-alignment failed");
				None
			},
		};
		if let Some(chain) = chain {
			state.next_nonce = Some(state.next_nonce.map_or(chain, |next| next.max(chain)));
		}
		Ok(())
	}

	/// Runs [`reconcile`](Self::reconcile) every reconcile interval.
	///
	/// The task ends once the coordinator is dropped. Does nothing outside
	/// fast mode.
	pub fn spawn_reconciler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		if !self.options.fast_mode {
			return None;
		}
		let weak = Arc::downgrade(self);
		let interval = self.options.reconcile_interval();
		Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let Some(coordinator) = weak.upgrade() else {
					break;
				};
				if let Err(error) = coordinator.reconcile().await {
					tracing::warn!(error = %error, "Nonce reconciliation failed");
				}
			}
		}))
	}
}
