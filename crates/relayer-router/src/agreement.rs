//! Quorum reads on top of the fallback router.
//!
//! The agreement router elects a block number from every endpoint, pins
//! state reads to a block and only accepts a result once `quorum` endpoints
//! returned the byte-identical value. One detached task runs per endpoint;
//! once a value reaches the quorum the remaining tasks are left to finish
//! their in-flight request and their results are discarded. Tasks still
//! waiting for their endpoint to sync stop polling. Reads without a quorum variant
//! go through the fallback router.

use crate::election::{elect_rounded_median, BlockTracker, ElectedBlock, ElectionFn};
use crate::{AgreementFailure, CuratedRpcList, EndpointFailure, FallbackRouter, RouterError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use relayer_rpc::{with_timeout, EndpointHandle, EndpointInterface, EventType, Listener, RpcError};
use relayer_types::{
	Address, AgreementOptions, BlockHeader, BlockTag, Bytes, CallRequest, FallbackOptions,
	FeeHistory, MetricPoint, MetricsSink, TransactionReceipt, B256, U256,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Router that elects block numbers and requires agreement on call results.
pub struct AgreementRouter {
	fallback: FallbackRouter,
	options: AgreementOptions,
	elect: ElectionFn,
	elected: Mutex<Option<ElectedBlock>>,
	tracker: Arc<BlockTracker>,
	call_cache: DashMap<String, (Bytes, Instant)>,
	curated: Option<Arc<CuratedRpcList>>,
}

impl AgreementRouter {
	/// Creates an agreement router over `endpoints`.
	///
	/// # Errors
	///
	/// Fails on fewer than two endpoints and on a quorum outside `2..=N`.
	pub fn new(
		endpoints: Vec<EndpointHandle>,
		fallback_options: FallbackOptions,
		options: AgreementOptions,
	) -> Result<Self, RouterError> {
		let fallback = FallbackRouter::new(endpoints, fallback_options)?;
		let count = fallback.endpoints().len();
		if options.quorum < 2 || options.quorum > count {
			return Err(RouterError::Config(format!(
				"Quorum must be between 2 and {}, got {}",
				count, options.quorum
			)));
		}

		let curated = options.curated_list.as_ref().map(|curated_options| {
			let labels = fallback
				.endpoints()
				.iter()
				.map(|e| e.label().to_string())
				.collect();
			Arc::new(CuratedRpcList::new(labels, curated_options, options.quorum))
		});
		let tracker = Arc::new(BlockTracker::new(Duration::from_millis(
			options.avg_block_time_ms,
		)));

		Ok(Self {
			fallback,
			options,
			elect: Arc::new(elect_rounded_median),
			elected: Mutex::new(None),
			tracker,
			call_cache: DashMap::new(),
			curated,
		})
	}

	/// Replaces the block election function.
	pub fn with_election<F>(mut self, elect: F) -> Self
	where
		F: Fn(&[u64]) -> Option<u64> + Send + Sync + 'static,
	{
		self.elect = Arc::new(elect);
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
		self.fallback = self.fallback.with_metrics(metrics);
		self
	}

	pub fn fallback(&self) -> &FallbackRouter {
		&self.fallback
	}

	pub fn options(&self) -> &AgreementOptions {
		&self.options
	}

	pub fn curated(&self) -> Option<&Arc<CuratedRpcList>> {
		self.curated.as_ref()
	}

	/// Endpoints taking part in elections and quorum reads.
	fn participants(&self) -> Vec<EndpointHandle> {
		let endpoints = self.fallback.endpoints();
		match &self.curated {
			Some(curated) => {
				let healthy = curated.healthy();
				endpoints
					.iter()
					.filter(|e| healthy.iter().any(|label| label == e.label()))
					.cloned()
					.collect()
			},
			None => endpoints.to_vec(),
		}
	}

	fn record(&self, operation: &str, endpoint: &str, success: bool, latency: Duration) {
		if let Some(curated) = &self.curated {
			curated.score(endpoint, success);
		}
		self.fallback.metrics().report(MetricPoint {
			operation: operation.to_string(),
			endpoint: endpoint.to_string(),
			chain_id: self.fallback.chain_id(),
			success,
			latency,
		});
	}

	/// Elects the current block number, reusing a recent election.
	///
	/// Every participant is queried concurrently with the block number
	/// timeout. Numbers failing the sanity checks count as errors, and
	/// endpoints whose number has stopped moving are left out of the
	/// election while fresher ones exist.
	pub async fn elect_block_number(&self) -> Result<u64, RouterError> {
		let ttl = self.options.block_number_cache_ttl();
		let cached = *self.elected.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(elected) = cached.filter(|elected| elected.is_fresh(ttl)) {
			return Ok(elected.value);
		}

		let timeout = self.options.block_number_timeout();
		let participants = self.participants();
		let results = join_all(participants.iter().map(|endpoint| async move {
			let started = Instant::now();
			let result = with_timeout(timeout, endpoint.get_block_number()).await;
			(endpoint, result, started.elapsed())
		}))
		.await;

		let mut numbers = Vec::with_capacity(results.len());
		let mut errors = Vec::new();
		for (endpoint, result, latency) in results {
			let result = result.and_then(|number| {
				self.tracker.observe(endpoint.label(), number)?;
				Ok(number)
			});
			self.record("getBlockNumber", endpoint.label(), result.is_ok(), latency);
			match result {
				Ok(number) => numbers.push((endpoint.label(), number)),
				Err(error) => {
					tracing::debug!(endpoint = %endpoint.label(), error = %error, "Block number query failed");
					errors.push(EndpointFailure {
						endpoint: endpoint.label().to_string(),
						error,
					});
				},
			}
		}

		if numbers.is_empty() {
			return Err(RouterError::AllFailed {
				operation: "getBlockNumber".to_string(),
				errors,
			});
		}

		let live: Vec<u64> = numbers
			.iter()
			.filter(|(label, _)| !self.tracker.is_stale(label))
			.map(|(_, number)| *number)
			.collect();
		let candidates: Vec<u64> = if live.is_empty() {
			numbers.iter().map(|(_, number)| *number).collect()
		} else {
			live
		};
		let value = (self.elect)(&candidates).ok_or_else(|| RouterError::AllFailed {
			operation: "getBlockNumber".to_string(),
			errors: Vec::new(),
		})?;

		*self.elected.lock().unwrap_or_else(|e| e.into_inner()) = Some(ElectedBlock::new(value));
		tracing::trace!(block = value, candidates = ?candidates, "Elected block number");
		Ok(value)
	}

	/// Runs `op` on every participant and resolves with the first value that
	/// `quorum` endpoints returned.
	///
	/// Every task is bounded by the all endpoints timeout; a timed out task
	/// counts as an error and never as a vote.
	pub async fn execute_with_agreement<T, F, Fut>(
		&self,
		operation: &str,
		block: Option<u64>,
		op: F,
	) -> Result<T, RouterError>
	where
		T: Clone + PartialEq + fmt::Display + Send + 'static,
		F: Fn(EndpointHandle) -> Fut,
		Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
	{
		let umbrella = self.fallback.options().all_endpoints_timeout();
		let quorum = self.options.quorum;
		let (tx, mut rx) = mpsc::unbounded_channel();
		for endpoint in self.participants() {
			let tx = tx.clone();
			let label = endpoint.label().to_string();
			let task = op(endpoint);
			tokio::spawn(async move {
				let started = Instant::now();
				let result = with_timeout(umbrella, task).await;
				// The receiver is gone once a quorum was reached.
				let _ = tx.send((label, result, started.elapsed()));
			});
		}
		drop(tx);

		let mut votes: Vec<(T, usize)> = Vec::new();
		let mut errors = Vec::new();
		let mut successes = 0;
		while let Some((label, result, latency)) = rx.recv().await {
			self.record(operation, &label, result.is_ok(), latency);
			match result {
				Ok(value) => {
					successes += 1;
					let count = match votes.iter_mut().find(|(v, _)| *v == value) {
						Some((_, count)) => {
							*count += 1;
							*count
						},
						None => {
							votes.push((value.clone(), 1));
							1
						},
					};
					if count >= quorum {
						return Ok(value);
					}
				},
				Err(error) => {
					tracing::debug!(operation = %operation, endpoint = %label, error = %error, "Agreement task failed");
					errors.push(EndpointFailure {
						endpoint: label,
						error,
					});
				},
			}
		}

		if self.options.ignore_agreement_on_insufficient_responses {
			let mut best: Option<&(T, usize)> = None;
			for vote in &votes {
				if best.is_none_or(|(_, count)| vote.1 > *count) {
					best = Some(vote);
				}
			}
			if let Some((value, count)) = best {
				tracing::warn!(
					operation = %operation,
					votes = *count,
					quorum = quorum,
					"Quorum not reached, using most voted result"
				);
				return Ok(value.clone());
			}
		}

		Err(RouterError::Agreement(AgreementFailure {
			operation: operation.to_string(),
			block,
			quorum,
			successes,
			results: votes
				.into_iter()
				.map(|(value, count)| (value.to_string(), count))
				.collect(),
			errors,
			show_results: successes >= self.options.minimal_providers_count,
		}))
	}

	async fn resolve_block(&self, block: Option<BlockTag>) -> Result<u64, RouterError> {
		match block {
			Some(BlockTag::Number(number)) => Ok(number),
			Some(BlockTag::Pending) => Err(RouterError::InvalidArgument(
				"Agreement reads cannot use the pending block".to_string(),
			)),
			Some(BlockTag::Latest) | None if self.options.require_explicit_block_tag => {
				Err(RouterError::InvalidArgument(
					"Agreement reads require an explicit block number".to_string(),
				))
			},
			Some(BlockTag::Latest) | None => self.elect_block_number().await,
		}
	}

	/// Quorum `eth_call` at `block`, or at the elected block when none is given.
	///
	/// Agreed results are cached per normalized request and block.
	pub async fn call_with_agreement(
		&self,
		request: &CallRequest,
		block: Option<BlockTag>,
	) -> Result<Bytes, RouterError> {
		let target = self.resolve_block(block).await?;
		let ttl = self.options.call_cache_ttl();
		let key = request.cache_key(&BlockTag::Number(target));
		let cached = self
			.call_cache
			.get(&key)
			.filter(|entry| entry.1.elapsed() < ttl)
			.map(|entry| entry.0.clone());
		if let Some(result) = cached {
			return Ok(result);
		}

		let sync = self.block_sync();
		let _stop = sync.stop_on_drop();
		let single_timeout = self.fallback.options().single_endpoint_timeout();
		let request = request.clone();
		let result = self
			.execute_with_agreement("call", Some(target), move |endpoint| {
				let sync = sync.clone();
				let request = request.clone();
				async move {
					sync.wait_for(&endpoint, target).await?;
					with_timeout(
						single_timeout,
						endpoint.call(&request, BlockTag::Number(target)),
					)
					.await
				}
			})
			.await?;

		self.call_cache.retain(|_, (_, at)| at.elapsed() < ttl);
		self.call_cache.insert(key, (result.clone(), Instant::now()));
		Ok(result)
	}

	/// Quorum balance read at `block`, or at the elected block when none is given.
	pub async fn get_balance_with_agreement(
		&self,
		address: Address,
		block: Option<BlockTag>,
	) -> Result<U256, RouterError> {
		let target = self.resolve_block(block).await?;
		let sync = self.block_sync();
		let _stop = sync.stop_on_drop();
		let single_timeout = self.fallback.options().single_endpoint_timeout();
		self.execute_with_agreement("getBalance", Some(target), move |endpoint| {
			let sync = sync.clone();
			async move {
				sync.wait_for(&endpoint, target).await?;
				with_timeout(
					single_timeout,
					endpoint.get_balance(address, BlockTag::Number(target)),
				)
				.await
			}
		})
		.await
	}

	fn block_sync(&self) -> BlockSync {
		BlockSync {
			tracker: self.tracker.clone(),
			poll_timeout: self.options.block_number_timeout(),
			pause: self.options.sleep_between_block_sync(),
			stopped: Arc::new(AtomicBool::new(false)),
		}
	}
}

/// Waits for one endpoint to reach a block before it is queried.
#[derive(Clone)]
struct BlockSync {
	tracker: Arc<BlockTracker>,
	poll_timeout: Duration,
	pause: Duration,
	/// Set once the read resolved; pending waits give up.
	stopped: Arc<AtomicBool>,
}

/// Stops every wait of a [`BlockSync`] when dropped.
struct StopSync(Arc<AtomicBool>);

impl Drop for StopSync {
	fn drop(&mut self) {
		self.0.store(true, Ordering::Release);
	}
}

impl BlockSync {
	fn stop_on_drop(&self) -> StopSync {
		StopSync(self.stopped.clone())
	}

	fn check_stopped(&self) -> Result<(), RpcError> {
		if self.stopped.load(Ordering::Acquire) {
			return Err(RpcError::Cancelled("read already resolved".to_string()));
		}
		Ok(())
	}

	async fn wait_for(&self, endpoint: &EndpointHandle, target: u64) -> Result<(), RpcError> {
		loop {
			self.check_stopped()?;
			let current = with_timeout(self.poll_timeout, endpoint.get_block_number()).await?;
			self.tracker.observe(endpoint.label(), current)?;
			if current >= target {
				return Ok(());
			}
			tracing::trace!(endpoint = %endpoint.label(), current = current, target = target, "Waiting for endpoint to sync");
			tokio::time::sleep(self.pause).await;
			self.check_stopped()?;
		}
	}
}

#[async_trait]
impl EndpointInterface for AgreementRouter {
	async fn get_chain_id(&self) -> Result<u64, RpcError> {
		self.fallback.get_chain_id().await
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.elect_block_number().await.map_err(RpcError::from)
	}

	async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>, RpcError> {
		self.fallback.get_block(tag).await
	}

	async fn get_transaction_count(
		&self,
		address: Address,
		tag: BlockTag,
	) -> Result<u64, RpcError> {
		self.fallback.get_transaction_count(address, tag).await
	}

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, RpcError> {
		self.get_balance_with_agreement(address, Some(tag))
			.await
			.map_err(RpcError::from)
	}

	async fn call(&self, request: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError> {
		self.call_with_agreement(request, Some(tag))
			.await
			.map_err(RpcError::from)
	}

	async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
		self.fallback.estimate_gas(request).await
	}

	async fn get_gas_price(&self) -> Result<u128, RpcError> {
		self.fallback.get_gas_price().await
	}

	async fn get_max_priority_fee_per_gas(&self) -> Result<u128, RpcError> {
		self.fallback.get_max_priority_fee_per_gas().await
	}

	async fn get_fee_history(
		&self,
		block_count: u64,
		newest_block: BlockTag,
		reward_percentiles: &[f64],
	) -> Result<FeeHistory, RpcError> {
		self.fallback
			.get_fee_history(block_count, newest_block, reward_percentiles)
			.await
	}

	async fn get_transaction_receipt(
		&self,
		hash: B256,
	) -> Result<Option<TransactionReceipt>, RpcError> {
		self.fallback.get_transaction_receipt(hash).await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
		self.fallback.send_raw_transaction(raw).await
	}

	fn on(&self, event: EventType, listener: Listener) {
		self.fallback.on(event, listener)
	}

	fn once(&self, event: EventType, listener: Listener) {
		self.fallback.once(event, listener)
	}

	fn off(&self, event: &EventType, listener: Option<&Listener>) {
		self.fallback.off(event, listener)
	}

	fn remove_all_listeners(&self, event: Option<&EventType>) {
		self.fallback.remove_all_listeners(event)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relayer_rpc::testing::MockEndpoint;
	use relayer_types::CuratedListOptions;

	fn transport() -> RpcError {
		RpcError::Transport("connection refused".to_string())
	}

	fn router_with(mocks: &[Arc<MockEndpoint>], options: AgreementOptions) -> AgreementRouter {
		let handles = mocks
			.iter()
			.enumerate()
			.map(|(i, m)| m.handle(&format!("http://rpc-{}", i)))
			.collect();
		AgreementRouter::new(handles, FallbackOptions::default(), options).unwrap()
	}

	fn router(mocks: &[Arc<MockEndpoint>]) -> AgreementRouter {
		router_with(mocks, AgreementOptions::default())
	}

	/// Mocks reporting `blocks`, `None` meaning the endpoint fails.
	fn block_mocks(blocks: &[Option<u64>]) -> Vec<Arc<MockEndpoint>> {
		blocks
			.iter()
			.map(|block| {
				let mock = MockEndpoint::new(1);
				match block {
					Some(number) => mock.set_block_number(*number),
					None => mock.with_state(|s| s.block_number.fail(transport())),
				}
				mock
			})
			.collect()
	}

	/// Mocks answering `eth_call` with one byte each; endpoint `i` answers
	/// after `i * 10ms` so results arrive in slice order.
	fn call_mocks(values: &[u8]) -> Vec<Arc<MockEndpoint>> {
		values
			.iter()
			.enumerate()
			.map(|(i, value)| {
				let mock = MockEndpoint::new(1);
				mock.set_block_number(100);
				mock.with_state(|s| s.call_result.set(Bytes::from(vec![*value])));
				mock.set_delay(Duration::from_millis(10 * i as u64));
				mock
			})
			.collect()
	}

	fn request() -> CallRequest {
		CallRequest::new(Address::repeat_byte(0xaa), vec![0x01, 0x02])
	}

	async fn elect(blocks: &[Option<u64>]) -> Result<u64, RouterError> {
		router(&block_mocks(blocks)).elect_block_number().await
	}

	#[tokio::test]
	async fn test_median_election() {
		assert_eq!(elect(&[Some(1), Some(2), Some(2)]).await.unwrap(), 2);
		assert_eq!(elect(&[Some(1), None, Some(2)]).await.unwrap(), 2);
		assert_eq!(elect(&[Some(1), Some(6), None, Some(2)]).await.unwrap(), 2);
		assert_eq!(elect(&[Some(3), Some(4), Some(1)]).await.unwrap(), 3);
		assert_eq!(
			elect(&[Some(3), None, None, Some(8), Some(100)]).await.unwrap(),
			8
		);
		assert_eq!(elect(&[Some(100), Some(100), Some(98)]).await.unwrap(), 100);
	}

	#[tokio::test]
	async fn test_election_fails_when_all_fail() {
		let err = elect(&[None, None, None]).await.unwrap_err();
		assert!(matches!(err, RouterError::AllFailed { ref errors, .. } if errors.len() == 3));
		assert!(err
			.to_string()
			.starts_with("All providers failed to fetch 'getBlockNumber'"));
	}

	#[tokio::test]
	async fn test_custom_election_function() {
		let mocks = block_mocks(&[Some(10), Some(20), Some(30)]);
		let router = router(&mocks).with_election(|numbers| numbers.iter().copied().max());
		assert_eq!(router.elect_block_number().await.unwrap(), 30);
	}

	#[tokio::test(start_paused = true)]
	async fn test_elected_block_is_cached() {
		let mocks = block_mocks(&[Some(10), Some(10), Some(10)]);
		let router = router(&mocks);
		router.elect_block_number().await.unwrap();
		router.elect_block_number().await.unwrap();
		assert_eq!(mocks[0].calls("get_block_number"), 1);

		tokio::time::advance(Duration::from_millis(60)).await;
		router.elect_block_number().await.unwrap();
		assert_eq!(mocks[0].calls("get_block_number"), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_block_timeout_counts_as_failure() {
		let mocks = block_mocks(&[Some(10), Some(12), Some(500)]);
		mocks[2].set_delay(Duration::from_secs(5));
		assert_eq!(router(&mocks).elect_block_number().await.unwrap(), 11);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stale_endpoint_excluded_from_election() {
		let mocks = block_mocks(&[Some(100), Some(5), Some(5)]);
		let router = router(&mocks);
		assert_eq!(router.elect_block_number().await.unwrap(), 5);

		mocks[0].set_block_number(115);
		tokio::time::advance(Duration::from_secs(180)).await;
		// The other endpoints are stuck at 5 and no longer decide the median.
		assert_eq!(router.elect_block_number().await.unwrap(), 115);
	}

	async fn quorum_call(values: &[u8], options: AgreementOptions) -> Result<Bytes, RouterError> {
		let mocks = call_mocks(values);
		router_with(&mocks, options)
			.call_with_agreement(&request(), Some(BlockTag::Number(100)))
			.await
	}

	fn quorum(quorum: usize) -> AgreementOptions {
		AgreementOptions {
			quorum,
			..Default::default()
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_first_value_to_reach_quorum_wins() {
		let result = quorum_call(&[5, 3, 5, 3, 2, 4, 2, 2], quorum(2)).await;
		assert_eq!(result.unwrap(), Bytes::from(vec![5]));

		let result = quorum_call(&[5, 3, 8, 7, 1, 4, 2, 2], quorum(2)).await;
		assert_eq!(result.unwrap(), Bytes::from(vec![2]));

		let result = quorum_call(&[1, 2, 2], quorum(2)).await;
		assert_eq!(result.unwrap(), Bytes::from(vec![2]));

		let result = quorum_call(&[2, 2, 2], quorum(3)).await;
		assert_eq!(result.unwrap(), Bytes::from(vec![2]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_quorum_not_reached() {
		match quorum_call(&[2, 2, 1], quorum(3)).await {
			Err(RouterError::Agreement(failure)) => {
				assert_eq!(failure.successes, 3);
				assert_eq!(
					failure.results,
					vec![("0x02".to_string(), 2), ("0x01".to_string(), 1)]
				);
				assert!(failure.show_results);
			},
			other => panic!("unexpected result: {:?}", other),
		}

		match quorum_call(&[1, 2], quorum(2)).await {
			Err(RouterError::Agreement(failure)) => {
				assert_eq!(failure.successes, 2);
				// Fewer successes than minimal_providers_count hide the result map.
				assert!(!failure.show_results);
				assert!(failure
					.to_string()
					.starts_with("operation=call Failed to find at least 2 agreeing providers at block 100"));
			},
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_failure_lists_every_error() {
		let mocks = call_mocks(&[1, 2, 3]);
		mocks[1].with_state(|s| s.call_result.fail(transport()));
		let err = router(&mocks)
			.call_with_agreement(&request(), Some(BlockTag::Number(100)))
			.await
			.unwrap_err();
		match err {
			RouterError::Agreement(failure) => {
				assert_eq!(failure.errors.len(), 1);
				assert_eq!(failure.errors[0].endpoint, "http://rpc-1");
				assert_eq!(failure.results.len(), 2);
			},
			other => panic!("unexpected error: {}", other),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_most_voted_result_when_agreement_ignored() {
		let options = AgreementOptions {
			quorum: 3,
			ignore_agreement_on_insufficient_responses: true,
			..Default::default()
		};
		let result = quorum_call(&[1, 2, 2], options).await;
		assert_eq!(result.unwrap(), Bytes::from(vec![2]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_scenario_elected_block_and_quorum_call() {
		let mocks = call_mocks(&[2, 2, 1]);
		mocks[2].set_block_number(98);
		let router = router(&mocks);

		assert_eq!(router.elect_block_number().await.unwrap(), 100);
		let result = router.call_with_agreement(&request(), None).await.unwrap();
		assert_eq!(result, Bytes::from(vec![2]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_lagging_endpoint_waits_for_block() {
		let mocks = call_mocks(&[7, 7, 7]);
		mocks[1].with_state(|s| s.call_result.fail(transport()));
		mocks[0].with_state(|s| {
			s.block_number.push(Ok(98));
			s.block_number.push(Ok(99));
		});
		let result = router(&mocks)
			.call_with_agreement(&request(), Some(BlockTag::Number(100)))
			.await
			.unwrap();
		assert_eq!(result, Bytes::from(vec![7]));
		assert_eq!(mocks[0].calls("get_block_number"), 3);
		assert_eq!(mocks[0].calls("call"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_lagging_endpoint_stops_polling_after_quorum() {
		let mocks = call_mocks(&[3, 3, 3]);
		mocks[2].set_block_number(50);
		let router = router(&mocks);

		let result = router
			.call_with_agreement(&request(), Some(BlockTag::Number(100)))
			.await
			.unwrap();
		assert_eq!(result, Bytes::from(vec![3]));
		let polls = mocks[2].calls("get_block_number");
		assert!(polls >= 1);

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(mocks[2].calls("get_block_number"), polls);
		assert_eq!(mocks[2].calls("call"), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_agreed_call_is_cached() {
		let mocks = call_mocks(&[4, 4, 4]);
		let router = router(&mocks);
		for _ in 0..2 {
			router
				.call_with_agreement(&request(), Some(BlockTag::Number(100)))
				.await
				.unwrap();
		}
		assert_eq!(mocks[0].calls("call"), 1);
	}

	#[tokio::test]
	async fn test_explicit_block_tag_required() {
		let mocks = call_mocks(&[1, 1]);
		let options = AgreementOptions {
			require_explicit_block_tag: true,
			..Default::default()
		};
		let router = router_with(&mocks, options);
		assert!(matches!(
			router.call_with_agreement(&request(), None).await,
			Err(RouterError::InvalidArgument(_))
		));
		assert!(matches!(
			router
				.call_with_agreement(&request(), Some(BlockTag::Pending))
				.await,
			Err(RouterError::InvalidArgument(_))
		));
	}

	#[tokio::test]
	async fn test_balance_agreement() {
		let mocks = block_mocks(&[Some(50), Some(50), Some(50)]);
		mocks[0].with_state(|s| s.balance.set(U256::from(10)));
		mocks[1].with_state(|s| s.balance.set(U256::from(12)));
		mocks[2].with_state(|s| s.balance.set(U256::from(12)));
		let balance = router(&mocks)
			.get_balance(Address::ZERO, BlockTag::Latest)
			.await
			.unwrap();
		assert_eq!(balance, U256::from(12));
	}

	#[test]
	fn test_quorum_bounds() {
		let mocks = block_mocks(&[Some(1), Some(1)]);
		let handles: Vec<_> = mocks.iter().map(|m| m.handle("rpc")).collect();
		for q in [1, 3] {
			assert!(AgreementRouter::new(handles.clone(), FallbackOptions::default(), quorum(q))
				.is_err());
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_curated_list_drops_failing_endpoint() {
		let mocks = block_mocks(&[None, Some(10), Some(10)]);
		let options = AgreementOptions {
			curated_list: Some(CuratedListOptions {
				minimal_providers_count: Some(2),
				..Default::default()
			}),
			..Default::default()
		};
		let router = router_with(&mocks, options);
		router.elect_block_number().await.unwrap();
		assert_eq!(mocks[0].calls("get_block_number"), 1);

		tokio::time::advance(Duration::from_secs(30)).await;
		router.elect_block_number().await.unwrap();
		assert_eq!(mocks[0].calls("get_block_number"), 1);
		assert!(router.curated().unwrap().is_quarantined("http://rpc-0"));
	}
}
