//! Active-endpoint routing with failover.
//!
//! Every read goes to the active endpoint. A recoverable error moves the
//! active index to the next endpoint, migrates every registered listener and
//! retries there; after N-1 retries the error of the last endpoint tried is
//! returned. Concurrent callers that fail on the same endpoint advance the
//! index only once: each attempt snapshots the index and only the caller
//! whose snapshot is still current performs the switch.

use crate::RouterError;
use async_trait::async_trait;
use relayer_rpc::{with_timeout, EndpointHandle, EndpointInterface, EventType, Listener, ListenerSet, RpcError};
use relayer_types::{
	Address, BlockHeader, BlockTag, Bytes, CallRequest, FallbackOptions, FeeHistory, MetricPoint,
	MetricsSink, NoopMetrics, TransactionReceipt, B256, U256,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Router that sends reads to one active endpoint and fails over on errors.
pub struct FallbackRouter {
	chain_id: u64,
	endpoints: Vec<EndpointHandle>,
	active: AtomicUsize,
	/// Listeners registered through the router, replayed on failover.
	listeners: Arc<ListenerSet>,
	options: FallbackOptions,
	metrics: Arc<dyn MetricsSink>,
}

impl FallbackRouter {
	/// Creates a router over `endpoints`; the first one starts as active.
	///
	/// # Errors
	///
	/// Fails when fewer than two endpoints are given or when they are bound
	/// to different chains.
	pub fn new(endpoints: Vec<EndpointHandle>, options: FallbackOptions) -> Result<Self, RouterError> {
		if endpoints.len() < 2 {
			return Err(RouterError::Config(format!(
				"At least 2 endpoints are required, got {}",
				endpoints.len()
			)));
		}
		let chain_id = endpoints[0].chain_id();
		if let Some(other) = endpoints.iter().find(|e| e.chain_id() != chain_id) {
			return Err(RouterError::Config(format!(
				"Endpoint {} is bound to chain {}, expected {}",
				other.label(),
				other.chain_id(),
				chain_id
			)));
		}

		Ok(Self {
			chain_id,
			endpoints,
			active: AtomicUsize::new(0),
			listeners: Arc::new(ListenerSet::new()),
			options,
			metrics: Arc::new(NoopMetrics),
		})
	}

	pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn chain_id(&self) -> u64 {
		self.chain_id
	}

	pub fn endpoints(&self) -> &[EndpointHandle] {
		&self.endpoints
	}

	pub fn options(&self) -> &FallbackOptions {
		&self.options
	}

	pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
		&self.metrics
	}

	pub fn active_index(&self) -> usize {
		self.active.load(Ordering::SeqCst)
	}

	pub fn active(&self) -> &EndpointHandle {
		&self.endpoints[self.active_index()]
	}

	/// Runs `op` against the active endpoint, failing over on recoverable errors.
	///
	/// Each attempt is bounded by the single endpoint timeout and the whole
	/// operation by the all endpoints timeout.
	pub async fn execute_with_fallback<T, F, Fut>(
		&self,
		operation: &str,
		op: F,
	) -> Result<T, RouterError>
	where
		F: Fn(EndpointHandle) -> Fut + Send + Sync,
		Fut: Future<Output = Result<T, RpcError>> + Send,
		T: Send,
	{
		let deadline = self.options.all_endpoints_timeout();
		match tokio::time::timeout(deadline, self.run_with_fallback(operation, &op)).await {
			Ok(result) => result,
			Err(_) => Err(RouterError::Timeout {
				operation: operation.to_string(),
				after: deadline,
			}),
		}
	}

	async fn run_with_fallback<T, F, Fut>(&self, operation: &str, op: &F) -> Result<T, RouterError>
	where
		F: Fn(EndpointHandle) -> Fut + Send + Sync,
		Fut: Future<Output = Result<T, RpcError>> + Send,
		T: Send,
	{
		let single_timeout = self.options.single_endpoint_timeout();
		let mut retry = 0;
		loop {
			let snapshot = self.active_index();
			let endpoint = self.endpoints[snapshot].clone();
			let started = Instant::now();
			let result = with_timeout(single_timeout, op(endpoint.clone())).await;
			self.metrics.report(MetricPoint {
				operation: operation.to_string(),
				endpoint: endpoint.label().to_string(),
				chain_id: self.chain_id,
				success: result.is_ok(),
				latency: started.elapsed(),
			});

			let error = match result {
				Ok(value) => return Ok(value),
				Err(error) => error,
			};
			let kind = error.kind();
			if self.options.is_unrecoverable(kind) || retry >= self.endpoints.len() - 1 {
				return Err(RouterError::Endpoint {
					endpoint: endpoint.label().to_string(),
					source: error,
				});
			}

			tracing::warn!(
				operation = %operation,
				endpoint = %endpoint.label(),
				kind = ?kind,
				error = %error,
				retry = retry,
				"Endpoint failed, falling back"
			);
			self.switch_from(snapshot);
			retry += 1;
		}
	}

	/// Advances the active index past `snapshot` if nobody did it yet.
	fn switch_from(&self, snapshot: usize) {
		let next = (snapshot + 1) % self.endpoints.len();
		if self
			.active
			.compare_exchange(snapshot, next, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}

		let old = &self.endpoints[snapshot];
		let new = &self.endpoints[next];
		old.remove_all_listeners(None);
		for entry in self.listeners.entries() {
			if entry.once {
				new.once(entry.event, entry.listener);
			} else {
				new.on(entry.event, entry.listener);
			}
		}
		tracing::info!(
			from = %old.label(),
			to = %new.label(),
			listeners = self.listeners.len(),
			"Switched active endpoint"
		);
	}
}

#[async_trait]
impl EndpointInterface for FallbackRouter {
	async fn get_chain_id(&self) -> Result<u64, RpcError> {
		Ok(self.chain_id)
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.execute_with_fallback("getBlockNumber", |e| async move { e.get_block_number().await })
			.await
			.map_err(RpcError::from)
	}

	async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>, RpcError> {
		self.execute_with_fallback("getBlock", |e| async move { e.get_block(tag).await })
			.await
			.map_err(RpcError::from)
	}

	async fn get_transaction_count(
		&self,
		address: Address,
		tag: BlockTag,
	) -> Result<u64, RpcError> {
		self.execute_with_fallback("getTransactionCount", |e| async move {
			e.get_transaction_count(address, tag).await
		})
		.await
		.map_err(RpcError::from)
	}

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, RpcError> {
		self.execute_with_fallback("getBalance", |e| async move {
			e.get_balance(address, tag).await
		})
		.await
		.map_err(RpcError::from)
	}

	async fn call(&self, request: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError> {
		self.execute_with_fallback("call", |e| {
			let request = request.clone();
			async move { e.call(&request, tag).await }
		})
		.await
		.map_err(RpcError::from)
	}

	async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
		self.execute_with_fallback("estimateGas", |e| {
			let request = request.clone();
			async move { e.estimate_gas(&request).await }
		})
		.await
		.map_err(RpcError::from)
	}

	async fn get_gas_price(&self) -> Result<u128, RpcError> {
		self.execute_with_fallback("getGasPrice", |e| async move { e.get_gas_price().await })
			.await
			.map_err(RpcError::from)
	}

	async fn get_max_priority_fee_per_gas(&self) -> Result<u128, RpcError> {
		self.execute_with_fallback("maxPriorityFeePerGas", |e| async move {
			e.get_max_priority_fee_per_gas().await
		})
		.await
		.map_err(RpcError::from)
	}

	async fn get_fee_history(
		&self,
		block_count: u64,
		newest_block: BlockTag,
		reward_percentiles: &[f64],
	) -> Result<FeeHistory, RpcError> {
		self.execute_with_fallback("feeHistory", |e| {
			let percentiles = reward_percentiles.to_vec();
			async move {
				e.get_fee_history(block_count, newest_block, &percentiles)
					.await
			}
		})
		.await
		.map_err(RpcError::from)
	}

	async fn get_transaction_receipt(
		&self,
		hash: B256,
	) -> Result<Option<TransactionReceipt>, RpcError> {
		self.execute_with_fallback("getTransactionReceipt", |e| async move {
			e.get_transaction_receipt(hash).await
		})
		.await
		.map_err(RpcError::from)
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
		self.execute_with_fallback("sendRawTransaction", |e| {
			let raw = raw.clone();
			async move { e.send_raw_transaction(raw).await }
		})
		.await
		.map_err(RpcError::from)
	}

	fn on(&self, event: EventType, listener: Listener) {
		self.listeners.add(event, listener.clone(), false);
		self.active().on(event, listener);
	}

	fn once(&self, event: EventType, listener: Listener) {
		// The wrapper keeps the listener id, so it removes its own registry
		// entry when it fires on whichever endpoint is active at the time.
		let registry = Arc::downgrade(&self.listeners);
		let inner = listener.clone();
		let wrapped = listener.rebind(move |event| {
			if let Some(registry) = registry.upgrade() {
				registry.remove_id(inner.id());
			}
			inner.notify(event);
		});
		self.listeners.add(event, wrapped.clone(), true);
		self.active().once(event, wrapped);
	}

	fn off(&self, event: &EventType, listener: Option<&Listener>) {
		self.listeners.remove(event, listener);
		self.active().off(event, listener);
	}

	fn remove_all_listeners(&self, event: Option<&EventType>) {
		self.listeners.clear(event);
		self.active().remove_all_listeners(event);
	}
}
