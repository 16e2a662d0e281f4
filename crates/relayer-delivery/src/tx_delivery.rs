//! Delivery of one transaction through one endpoint.
//!
//! A delivery signs and broadcasts the transaction, waits roughly one block
//! and then checks whether the account nonce moved past the delivered nonce.
//! Until it has, the transaction is re-estimated and replaced with higher
//! fees, up to the configured number of attempts.

use crate::gas::{create_estimator, GasEstimator, GasLimitEstimator, GasOracle, GasOracles};
use crate::{DeliveryError, TxNonceCoordinator};
use alloy_primitives::keccak256;
use async_trait::async_trait;
use relayer_account::SignerInterface;
use relayer_rpc::{with_timeout, EndpointHandle};
use relayer_types::{
	Address, BlockTag, Bytes, CallRequest, DeliveryAttempt, DeliveryOptions, FeeStructure,
	MetricPoint, MetricsSink, NoopMetrics, RpcErrorKind, TxCall, UnsignedTx, B256, U256,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::instrument;

/// Source of the transaction input, resolved again before every attempt.
///
/// Lets callers refresh data that depends on chain state, such as a price
/// quote, between replacements.
#[async_trait]
pub trait CalldataProvider: Send + Sync {
	async fn calldata(&self) -> Result<Bytes, DeliveryError>;
}

#[async_trait]
impl CalldataProvider for Bytes {
	async fn calldata(&self) -> Result<Bytes, DeliveryError> {
		Ok(self.clone())
	}
}

/// What to deliver.
#[derive(Clone)]
pub struct DeliveryRequest {
	pub to: Address,
	pub value: U256,
	pub calldata: Arc<dyn CalldataProvider>,
}

impl DeliveryRequest {
	pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
		Self {
			to,
			value: U256::ZERO,
			calldata: Arc::new(data.into()),
		}
	}

	/// A request whose calldata is produced per attempt.
	pub fn lazy(to: Address, provider: Arc<dyn CalldataProvider>) -> Self {
		Self {
			to,
			value: U256::ZERO,
			calldata: provider,
		}
	}

	pub fn with_value(mut self, value: U256) -> Self {
		self.value = value;
		self
	}
}

impl From<TxCall> for DeliveryRequest {
	fn from(call: TxCall) -> Self {
		Self::new(call.to, call.data).with_value(call.value)
	}
}

impl fmt::Debug for DeliveryRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeliveryRequest")
			.field("to", &self.to)
			.field("value", &self.value)
			.finish_non_exhaustive()
	}
}

/// Everything a delivery needs to know about where it runs.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
	pub chain_id: u64,
	pub endpoint: EndpointHandle,
	pub options: Arc<DeliveryOptions>,
	/// Skip any gas oracle registered for the chain.
	pub disable_custom_gas_oracle: bool,
}

impl DeliveryContext {
	pub fn new(endpoint: EndpointHandle, options: Arc<DeliveryOptions>) -> Self {
		Self {
			chain_id: endpoint.chain_id(),
			endpoint,
			options,
			disable_custom_gas_oracle: false,
		}
	}
}

/// Progress of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
	Prepared,
	Broadcasting { attempt: u32 },
	WaitingForMining { attempt: u32 },
	Rescaling { attempt: u32 },
	Delivered { nonce: u64 },
	Failed,
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
	/// Label of the endpoint that delivered.
	pub endpoint: String,
	pub nonce: u64,
	/// Every hash broadcast for the nonce, oldest first.
	pub hashes: Vec<B256>,
	pub attempts: u32,
}

impl DeliveryReceipt {
	pub fn last_hash(&self) -> Option<B256> {
		self.hashes.last().copied()
	}
}

/// Delivers a single transaction through one endpoint.
pub struct TxDelivery {
	context: DeliveryContext,
	signer: Arc<dyn SignerInterface>,
	coordinator: Arc<TxNonceCoordinator>,
	estimator: Arc<dyn GasEstimator>,
	gas_limit: GasLimitEstimator,
	oracles: Arc<GasOracles>,
	metrics: Arc<dyn MetricsSink>,
	used: AtomicBool,
	state: Mutex<DeliveryState>,
}

impl TxDelivery {
	pub fn new(
		context: DeliveryContext,
		signer: Arc<dyn SignerInterface>,
		coordinator: Arc<TxNonceCoordinator>,
	) -> Self {
		Self {
			estimator: create_estimator(&context.options),
			gas_limit: GasLimitEstimator::new(&context.options),
			context,
			signer,
			coordinator,
			oracles: Arc::new(GasOracles::new()),
			metrics: Arc::new(NoopMetrics),
			used: AtomicBool::new(false),
			state: Mutex::new(DeliveryState::Prepared),
		}
	}

	pub fn with_oracles(mut self, oracles: Arc<GasOracles>) -> Self {
		self.oracles = oracles;
		self
	}

	pub fn with_estimator(mut self, estimator: Arc<dyn GasEstimator>) -> Self {
		self.estimator = estimator;
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn context(&self) -> &DeliveryContext {
		&self.context
	}

	pub fn state(&self) -> DeliveryState {
		*self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn set_state(&self, state: DeliveryState) {
		*self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
	}

	fn claim(&self) -> Result<(), DeliveryError> {
		if self.used.swap(true, Ordering::AcqRel) {
			return Err(DeliveryError::AlreadyUsed);
		}
		Ok(())
	}

	/// Delivers `request` with a freshly allocated nonce.
	pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
		self.claim()?;
		let nonce = match self.coordinator.allocate_nonce().await {
			Ok(nonce) => nonce,
			Err(error) => {
				self.set_state(DeliveryState::Failed);
				return Err(error);
			},
		};
		self.finish(self.run(request, nonce).await)
	}

	/// Delivers `request` with a nonce chosen by the caller.
	pub async fn deliver_at(
		&self,
		request: &DeliveryRequest,
		nonce: u64,
	) -> Result<DeliveryReceipt, DeliveryError> {
		self.claim()?;
		self.finish(self.run(request, nonce).await)
	}

	fn finish(
		&self,
		result: Result<DeliveryReceipt, DeliveryError>,
	) -> Result<DeliveryReceipt, DeliveryError> {
		match &result {
			Ok(receipt) => self.set_state(DeliveryState::Delivered {
				nonce: receipt.nonce,
			}),
			Err(_) => self.set_state(DeliveryState::Failed),
		}
		result
	}

	fn custom_oracle(&self) -> Option<&Arc<dyn GasOracle>> {
		if self.context.disable_custom_gas_oracle || self.context.options.force_disable_custom_gas_oracle {
			return None;
		}
		self.oracles.get(&self.context.chain_id)
	}

	async fn fees(&self, attempt: u32) -> Result<FeeStructure, DeliveryError> {
		if let Some(oracle) = self.custom_oracle() {
			let timeout = self.context.options.gas_oracle_timeout();
			match tokio::time::timeout(timeout, oracle.get_fees(&self.context, attempt)).await {
				Ok(Ok(fees)) if fees.same_model(&self.default_model()) => {
					return Ok(self.estimator.scale_fees(fees, attempt));
				},
				Ok(Ok(fees)) => {
					tracing::warn!(fees = %fees, "Gas oracle returned fees of another fee market");
				},
				Ok(Err(error)) => {
					tracing::warn!(error = %error, "Gas oracle failed, estimating fees");
				},
				Err(_) => {
					tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Gas oracle timed out, estimating fees");
				},
			}
		}
		self.estimator.estimate(&*self.context.endpoint, attempt).await
	}

	fn default_model(&self) -> FeeStructure {
		match self.context.options.fee_market {
			relayer_types::FeeMarket::Eip1559 => FeeStructure::eip1559(0, 0),
			relayer_types::FeeMarket::Auction => FeeStructure::auction(0),
		}
	}

	async fn prepare(
		&self,
		request: &DeliveryRequest,
		attempt: u32,
	) -> Result<(Bytes, u64, FeeStructure), DeliveryError> {
		let data = request.calldata.calldata().await?;
		let call = CallRequest {
			from: Some(self.signer.address()),
			to: Some(request.to),
			data: data.clone(),
			value: Some(request.value),
		};
		let gas_limit = self
			.gas_limit
			.estimate(&*self.context.endpoint, &call, attempt)
			.await?;
		let fees = self.fees(attempt).await?;
		Ok((data, gas_limit, fees))
	}

	#[instrument(skip_all, fields(endpoint = %self.context.endpoint.label(), chain_id = self.context.chain_id, nonce = nonce))]
	async fn run(&self, request: &DeliveryRequest, nonce: u64) -> Result<DeliveryReceipt, DeliveryError> {
		let options = self.context.options.clone();
		let endpoint = &self.context.endpoint;
		let from = self.signer.address();

		let (mut data, gas_limit, fees) = self.prepare(request, 0).await?;
		let mut attempt = DeliveryAttempt::first(nonce, gas_limit, fees);
		let mut hashes: Vec<B256> = Vec::new();

		loop {
			self.set_state(DeliveryState::Broadcasting {
				attempt: attempt.attempt,
			});
			let tx = UnsignedTx {
				chain_id: self.context.chain_id,
				from,
				to: request.to,
				data: data.clone(),
				value: request.value,
				nonce,
				gas_limit: attempt.gas_limit,
				fee: attempt.fee,
			};
			let raw = self.signer.sign_transaction(&tx).await?;
			let local_hash = keccak256(&raw);

			let started = Instant::now();
			let sent = with_timeout(options.expected_delivery_time(), endpoint.send_raw_transaction(raw)).await;
			self.metrics.report(MetricPoint {
				operation: "sendRawTransaction".to_string(),
				endpoint: endpoint.label().to_string(),
				chain_id: self.context.chain_id,
				success: sent.is_ok(),
				latency: started.elapsed(),
			});

			let mut wait = true;
			match sent {
				Ok(hash) => {
					tracing::info!(
						attempt = attempt.attempt,
						tx_hash = %hash,
						gas_limit = attempt.gas_limit,
						fees = %attempt.fee,
						"Broadcast transaction"
					);
					self.coordinator.register(nonce, hash);
					if !hashes.contains(&hash) {
						hashes.push(hash);
					}
				},
				Err(error) => match error.kind() {
					RpcErrorKind::AlreadyKnown => {
						tracing::debug!(tx_hash = %local_hash, "Transaction already known to endpoint");
						self.coordinator.register(nonce, local_hash);
						if !hashes.contains(&local_hash) {
							hashes.push(local_hash);
						}
					},
					RpcErrorKind::NonceExpired => {
						if hashes.is_empty() {
							return Err(DeliveryError::SameNonceDeliveredElsewhere(nonce));
						}
						tracing::info!(attempt = attempt.attempt, "Nonce used by an earlier attempt");
						return Ok(self.receipt(nonce, hashes, attempt.attempt));
					},
					RpcErrorKind::ReplacementUnderpriced => {
						tracing::warn!(attempt = attempt.attempt, fees = %attempt.fee, error = %error, "Replacement underpriced");
						wait = false;
					},
					RpcErrorKind::InsufficientFunds => {
						return Err(DeliveryError::InsufficientFunds(error.to_string()));
					},
					_ => return Err(error.into()),
				},
			}

			if wait {
				self.set_state(DeliveryState::WaitingForMining {
					attempt: attempt.attempt,
				});
				tokio::time::sleep(options.expected_delivery_time()).await;
				match with_timeout(
					options.expected_delivery_time(),
					endpoint.get_transaction_count(from, BlockTag::Latest),
				)
				.await
				{
					Ok(count) if count > nonce => {
						tracing::info!(attempts = attempt.attempt, "Transaction delivered");
						return Ok(self.receipt(nonce, hashes, attempt.attempt));
					},
					Ok(_) => {},
					Err(error) => {
						tracing::warn!(error = %error, "Could not read account nonce");
					},
				}
			}

			if attempt.attempt >= options.max_attempts {
				return Err(DeliveryError::MaxAttempts(options.max_attempts));
			}

			self.set_state(DeliveryState::Rescaling {
				attempt: attempt.attempt,
			});
			let (next_data, gas_limit, fees) = self.prepare(request, attempt.attempt).await?;
			data = next_data;
			attempt = attempt.rescaled(gas_limit, fees);
		}
	}

	fn receipt(&self, nonce: u64, hashes: Vec<B256>, attempts: u32) -> DeliveryReceipt {
		DeliveryReceipt {
			endpoint: self.context.endpoint.label().to_string(),
			nonce,
			hashes,
			attempts,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{delivery_options, nonce_options, signer};
	use crate::{NonceFetcher, StaticGasOracle};
	use relayer_rpc::testing::MockEndpoint;
	use relayer_rpc::RpcError;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	fn delivery(mock: &Arc<MockEndpoint>, options: DeliveryOptions, fast_mode: bool) -> TxDelivery {
		let signer = signer();
		let nonce_options = nonce_options(fast_mode);
		let fetcher = NonceFetcher::new(vec![mock.handle("rpc-0")], &nonce_options).unwrap();
		let coordinator = Arc::new(TxNonceCoordinator::new(signer.address(), fetcher, nonce_options));
		let context = DeliveryContext::new(mock.handle("rpc-0"), Arc::new(options));
		TxDelivery::new(context, signer, coordinator)
	}

	fn request() -> DeliveryRequest {
		DeliveryRequest::new(Address::repeat_byte(0x22), vec![0xca, 0xfe])
	}

	fn rpc_error(message: &str) -> RpcError {
		RpcError::Rpc {
			code: -32000,
			message: message.to_string(),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_delivered_on_first_attempt() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.mine_on_send = true);
		let delivery = delivery(&mock, delivery_options(), false);

		let receipt = delivery.deliver(&request()).await.unwrap();
		assert_eq!(receipt.nonce, 0);
		assert_eq!(receipt.attempts, 1);
		assert_eq!(receipt.hashes.len(), 1);
		assert_eq!(receipt.endpoint, "rpc-0");
		assert_eq!(mock.sent().len(), 1);
		assert_eq!(delivery.state(), DeliveryState::Delivered { nonce: 0 });
	}

	#[tokio::test(start_paused = true)]
	async fn test_underpriced_rebroadcasts_without_waiting() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.mine_on_send = true);
		mock.push_send_result(Some(rpc_error("replacement transaction underpriced")));
		let delivery = delivery(&mock, delivery_options(), false);

		let started = Instant::now();
		let receipt = delivery.deliver(&request()).await.unwrap();
		assert_eq!(receipt.attempts, 2);
		assert_eq!(mock.sent().len(), 1);
		assert!(started.elapsed() < Duration::from_millis(1_500));
	}

	#[tokio::test(start_paused = true)]
	async fn test_gives_up_after_max_attempts() {
		let mock = MockEndpoint::new(1);
		let delivery = delivery(&mock, delivery_options(), false);

		let error = delivery.deliver(&request()).await.unwrap_err();
		assert_eq!(error.to_string(), "Failed to deliver transaction after 3 attempts");
		assert_eq!(mock.sent().len(), 3);
		assert_eq!(delivery.state(), DeliveryState::Failed);
	}

	#[tokio::test(start_paused = true)]
	async fn test_nonce_taken_by_someone_else() {
		let mock = MockEndpoint::new(1);
		mock.push_send_result(Some(rpc_error("nonce too low")));
		let delivery = delivery(&mock, delivery_options(), false);

		assert!(matches!(
			delivery.deliver(&request()).await,
			Err(DeliveryError::SameNonceDeliveredElsewhere(0))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_nonce_used_by_earlier_attempt_is_success() {
		let mock = MockEndpoint::new(1);
		mock.push_send_result(None);
		mock.push_send_result(Some(rpc_error("nonce too low")));
		let delivery = delivery(&mock, delivery_options(), false);

		let receipt = delivery.deliver(&request()).await.unwrap();
		assert_eq!(receipt.attempts, 2);
		assert_eq!(receipt.hashes.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_insufficient_funds_is_fatal() {
		let mock = MockEndpoint::new(1);
		mock.push_send_result(Some(rpc_error("insufficient funds for gas * price + value")));
		let delivery = delivery(&mock, delivery_options(), false);

		assert!(matches!(
			delivery.deliver(&request()).await,
			Err(DeliveryError::InsufficientFunds(_))
		));
		assert_eq!(mock.calls("send_raw_transaction"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_already_known_waits_for_mining() {
		let mock = MockEndpoint::new(1);
		mock.set_nonce(1);
		mock.push_send_result(Some(rpc_error("already known")));
		let delivery = delivery(&mock, delivery_options(), false);

		let receipt = delivery.deliver_at(&request(), 0).await.unwrap();
		assert_eq!(receipt.attempts, 1);
		assert_eq!(receipt.hashes.len(), 1);
		assert!(mock.sent().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_instance_is_single_use() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.mine_on_send = true);
		let delivery = delivery(&mock, delivery_options(), false);

		delivery.deliver(&request()).await.unwrap();
		assert!(matches!(
			delivery.deliver(&request()).await,
			Err(DeliveryError::AlreadyUsed)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_custom_oracle_replaces_estimation() {
		let mock = MockEndpoint::new(1);
		mock.with_state(|s| s.mine_on_send = true);
		let mut oracles = GasOracles::new();
		oracles.insert(
			1,
			Arc::new(StaticGasOracle::new(FeeStructure::eip1559(50_000_000_000, 2_000_000_000)))
				as Arc<dyn GasOracle>,
		);
		let oracles = Arc::new(oracles);

		let delivery = delivery(&mock, delivery_options(), false).with_oracles(oracles.clone());
		delivery.deliver(&request()).await.unwrap();
		assert_eq!(mock.calls("get_fee_history"), 0);

		let options = DeliveryOptions {
			force_disable_custom_gas_oracle: true,
			..delivery_options()
		};
		let delivery = self::delivery(&mock, options, false).with_oracles(oracles);
		delivery.deliver(&request()).await.unwrap();
		assert_eq!(mock.calls("get_fee_history"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_oracle_fees_rise_every_attempt() {
		let mock = MockEndpoint::new(1);
		let mut oracles = GasOracles::new();
		oracles.insert(
			1,
			Arc::new(StaticGasOracle::new(FeeStructure::eip1559(50, 2))) as Arc<dyn GasOracle>,
		);
		let delivery = delivery(&mock, delivery_options(), false).with_oracles(Arc::new(oracles));

		assert!(delivery.deliver(&request()).await.is_err());
		let sent = mock.sent();
		assert_eq!(sent.len(), 3);
		assert_ne!(sent[0], sent[1]);
		assert_ne!(sent[1], sent[2]);
		assert_eq!(mock.calls("get_fee_history"), 0);
	}

	struct CountingCalldata(AtomicUsize);

	#[async_trait]
	impl CalldataProvider for CountingCalldata {
		async fn calldata(&self) -> Result<Bytes, DeliveryError> {
			let n = self.0.fetch_add(1, Ordering::SeqCst);
			Ok(Bytes::from(vec![n as u8]))
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_calldata_resolved_per_attempt() {
		let mock = MockEndpoint::new(1);
		let provider = Arc::new(CountingCalldata(AtomicUsize::new(0)));
		let request = DeliveryRequest::lazy(Address::repeat_byte(1), provider.clone());
		let delivery = delivery(&mock, delivery_options(), false);

		assert!(delivery.deliver(&request).await.is_err());
		assert_eq!(provider.0.load(Ordering::SeqCst), 3);
		// Different calldata means a different transaction every attempt.
		let sent = mock.sent();
		assert_ne!(sent[0], sent[1]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_fast_mode_registers_broadcasts() {
		let mock = MockEndpoint::new(1);
		let delivery = delivery(&mock, delivery_options(), true);

		assert!(delivery.deliver(&request()).await.is_err());
		let pending = delivery.coordinator.pending(0).unwrap();
		assert_eq!(pending.hashes.len(), 3);
		assert_eq!(delivery.coordinator.next_nonce(), Some(1));
	}
}
