//! Scriptable in-memory endpoint for tests.
//!
//! Every response is a [`Scripted`] value: queued results are returned first,
//! then the fallback result repeats. A per-endpoint delay makes arrival order
//! deterministic under a paused tokio clock.

use crate::{ChainEvent, EndpointHandle, EndpointInterface, EventType, Listener, ListenerSet, RpcError};
use alloy_primitives::keccak256;
use async_trait::async_trait;
use relayer_types::{
	Address, BlockHeader, BlockTag, Bytes, CallRequest, FeeHistory, TransactionReceipt, B256,
	U256,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A queue of one-shot results followed by a repeating fallback.
#[derive(Debug, Clone)]
pub struct Scripted<T> {
	queue: VecDeque<Result<T, RpcError>>,
	fallback: Result<T, RpcError>,
}

impl<T: Clone> Scripted<T> {
	pub fn new(value: T) -> Self {
		Self {
			queue: VecDeque::new(),
			fallback: Ok(value),
		}
	}

	/// Replaces the repeating result with `value`.
	pub fn set(&mut self, value: T) {
		self.fallback = Ok(value);
	}

	/// Replaces the repeating result with an error.
	pub fn fail(&mut self, error: RpcError) {
		self.fallback = Err(error);
	}

	/// Queues a result returned once before the fallback.
	pub fn push(&mut self, result: Result<T, RpcError>) {
		self.queue.push_back(result);
	}

	/// Current repeating value, if it is a success.
	pub fn current(&self) -> Option<T> {
		self.fallback.as_ref().ok().cloned()
	}

	fn next(&mut self) -> Result<T, RpcError> {
		self.queue
			.pop_front()
			.unwrap_or_else(|| self.fallback.clone())
	}
}

/// Mutable state behind a [`MockEndpoint`].
#[derive(Debug)]
pub struct MockState {
	pub delay: Duration,
	pub block_number: Scripted<u64>,
	pub base_fee: Option<u128>,
	pub nonce: Scripted<u64>,
	/// Overrides the nonce for the pending tag when set.
	pub pending_nonce: Option<Result<u64, RpcError>>,
	pub balance: Scripted<U256>,
	pub call_result: Scripted<Bytes>,
	pub estimate_gas: Scripted<u64>,
	pub gas_price: Scripted<u128>,
	pub max_priority_fee: Scripted<u128>,
	pub fee_history: Scripted<FeeHistory>,
	pub receipts: HashMap<B256, TransactionReceipt>,
	pub receipt_error: Option<RpcError>,
	/// Outcomes of the next broadcasts, in order; `None` accepts the broadcast.
	pub send_results: VecDeque<Option<RpcError>>,
	/// Every broadcast that was accepted.
	pub sent: Vec<Bytes>,
	/// Accepted broadcasts are mined at once: the nonce advances and a receipt appears.
	pub mine_on_send: bool,
}

impl Default for MockState {
	fn default() -> Self {
		Self {
			delay: Duration::ZERO,
			block_number: Scripted::new(1),
			base_fee: Some(1_000_000_000),
			nonce: Scripted::new(0),
			pending_nonce: None,
			balance: Scripted::new(U256::ZERO),
			call_result: Scripted::new(Bytes::new()),
			estimate_gas: Scripted::new(21_000),
			gas_price: Scripted::new(1_000_000_000),
			max_priority_fee: Scripted::new(1_000_000_000),
			fee_history: Scripted::new(FeeHistory::default()),
			receipts: HashMap::new(),
			receipt_error: None,
			send_results: VecDeque::new(),
			sent: Vec::new(),
			mine_on_send: false,
		}
	}
}

/// In-memory endpoint with scripted responses and call counters.
#[derive(Debug)]
pub struct MockEndpoint {
	chain_id: u64,
	state: Mutex<MockState>,
	calls: Mutex<HashMap<&'static str, usize>>,
	listeners: ListenerSet,
}

impl MockEndpoint {
	pub fn new(chain_id: u64) -> Arc<Self> {
		Arc::new(Self {
			chain_id,
			state: Mutex::new(MockState::default()),
			calls: Mutex::new(HashMap::new()),
			listeners: ListenerSet::new(),
		})
	}

	/// Wraps this mock into a handle labelled `label`.
	pub fn handle(self: &Arc<Self>, label: &str) -> EndpointHandle {
		EndpointHandle::new(label, self.chain_id, self.clone())
	}

	fn state(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Runs `f` with exclusive access to the scripted state.
	pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
		f(&mut self.state())
	}

	pub fn set_delay(&self, delay: Duration) {
		self.state().delay = delay;
	}

	pub fn set_block_number(&self, number: u64) {
		self.state().block_number.set(number);
	}

	pub fn set_nonce(&self, nonce: u64) {
		self.state().nonce.set(nonce);
	}

	pub fn fail_all(&self, error: RpcError) {
		let mut state = self.state();
		state.block_number.fail(error.clone());
		state.nonce.fail(error.clone());
		state.balance.fail(error.clone());
		state.call_result.fail(error.clone());
		state.estimate_gas.fail(error.clone());
		state.gas_price.fail(error.clone());
		state.max_priority_fee.fail(error.clone());
		state.fee_history.fail(error.clone());
		state.receipt_error = Some(error);
	}

	pub fn insert_receipt(&self, hash: B256, block_number: u64) {
		self.state().receipts.insert(
			hash,
			TransactionReceipt {
				transaction_hash: hash,
				block_number: Some(block_number),
				status: true,
			},
		);
	}

	/// Number of calls made to `method`.
	pub fn calls(&self, method: &str) -> usize {
		self.calls
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(method)
			.copied()
			.unwrap_or(0)
	}

	/// Queues the outcome of the next broadcast.
	pub fn push_send_result(&self, error: Option<RpcError>) {
		self.state().send_results.push_back(error);
	}

	pub fn sent(&self) -> Vec<Bytes> {
		self.state().sent.clone()
	}

	/// Delivers `event` to registered listeners.
	pub fn emit(&self, event: &ChainEvent) -> usize {
		self.listeners.emit(event)
	}

	pub fn listener_count(&self) -> usize {
		self.listeners.len()
	}

	async fn enter(&self, method: &'static str) {
		*self
			.calls
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.entry(method)
			.or_default() += 1;
		let delay = self.state().delay;
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
	}
}

#[async_trait]
impl EndpointInterface for MockEndpoint {
	async fn get_chain_id(&self) -> Result<u64, RpcError> {
		self.enter("get_chain_id").await;
		Ok(self.chain_id)
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.enter("get_block_number").await;
		self.state().block_number.next()
	}

	async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>, RpcError> {
		self.enter("get_block").await;
		let mut state = self.state();
		let number = match tag {
			BlockTag::Number(number) => number,
			_ => state.block_number.next()?,
		};
		Ok(Some(BlockHeader {
			number,
			timestamp: number * 12,
			base_fee_per_gas: state.base_fee,
		}))
	}

	async fn get_transaction_count(
		&self,
		_address: Address,
		tag: BlockTag,
	) -> Result<u64, RpcError> {
		self.enter("get_transaction_count").await;
		let mut state = self.state();
		match (tag, &state.pending_nonce) {
			(BlockTag::Pending, Some(pending)) => pending.clone(),
			_ => state.nonce.next(),
		}
	}

	async fn get_balance(&self, _address: Address, _tag: BlockTag) -> Result<U256, RpcError> {
		self.enter("get_balance").await;
		self.state().balance.next()
	}

	async fn call(&self, _request: &CallRequest, _tag: BlockTag) -> Result<Bytes, RpcError> {
		self.enter("call").await;
		self.state().call_result.next()
	}

	async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64, RpcError> {
		self.enter("estimate_gas").await;
		self.state().estimate_gas.next()
	}

	async fn get_gas_price(&self) -> Result<u128, RpcError> {
		self.enter("get_gas_price").await;
		self.state().gas_price.next()
	}

	async fn get_max_priority_fee_per_gas(&self) -> Result<u128, RpcError> {
		self.enter("get_max_priority_fee_per_gas").await;
		self.state().max_priority_fee.next()
	}

	async fn get_fee_history(
		&self,
		_block_count: u64,
		_newest_block: BlockTag,
		_reward_percentiles: &[f64],
	) -> Result<FeeHistory, RpcError> {
		self.enter("get_fee_history").await;
		self.state().fee_history.next()
	}

	async fn get_transaction_receipt(
		&self,
		hash: B256,
	) -> Result<Option<TransactionReceipt>, RpcError> {
		self.enter("get_transaction_receipt").await;
		let state = self.state();
		match &state.receipt_error {
			Some(error) => Err(error.clone()),
			None => Ok(state.receipts.get(&hash).cloned()),
		}
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
		self.enter("send_raw_transaction").await;
		let mut state = self.state();
		if let Some(Some(error)) = state.send_results.pop_front() {
			return Err(error);
		}
		let hash = keccak256(&raw);
		state.sent.push(raw);
		if state.mine_on_send {
			let nonce = state.nonce.current().unwrap_or(0) + 1;
			state.nonce.set(nonce);
			let block = state.block_number.current().unwrap_or(0);
			state.receipts.insert(
				hash,
				TransactionReceipt {
					transaction_hash: hash,
					block_number: Some(block),
					status: true,
				},
			);
		}
		Ok(hash)
	}

	fn on(&self, event: EventType, listener: Listener) {
		self.listeners.add(event, listener, false);
	}

	fn once(&self, event: EventType, listener: Listener) {
		self.listeners.add(event, listener, true);
	}

	fn off(&self, event: &EventType, listener: Option<&Listener>) {
		self.listeners.remove(event, listener);
	}

	fn remove_all_listeners(&self, event: Option<&EventType>) {
		self.listeners.clear(event);
	}
}
