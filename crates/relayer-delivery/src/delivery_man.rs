//! Delivery of one transaction through every endpoint at once.

use crate::gas::GasOracles;
use crate::tx_delivery::{DeliveryContext, DeliveryReceipt, DeliveryRequest, TxDelivery};
use crate::{DeliveryError, TxNonceCoordinator};
use dashmap::DashSet;
use futures::future::join_all;
use relayer_account::SignerInterface;
use relayer_rpc::{with_timeout, EndpointHandle};
use relayer_types::{DeliveryOptions, MetricsSink, NoopMetrics, TransactionReceipt, B256};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Removes the endpoint from the busy set when the delivery task ends,
/// whether it finished, failed or panicked.
struct BusyGuard {
	busy: Arc<DashSet<String>>,
	label: String,
}

impl Drop for BusyGuard {
	fn drop(&mut self) {
		self.busy.remove(&self.label);
	}
}

/// Fans a transaction out over every endpoint with one shared nonce.
///
/// Each endpoint runs its own [`TxDelivery`] in a detached task; the first
/// one to succeed wins and the others keep running to completion in the
/// background. An endpoint still busy with an earlier transaction is skipped.
pub struct TxDeliveryMan {
	endpoints: Vec<EndpointHandle>,
	signer: Arc<dyn SignerInterface>,
	coordinator: Arc<TxNonceCoordinator>,
	options: Arc<DeliveryOptions>,
	oracles: Arc<GasOracles>,
	metrics: Arc<dyn MetricsSink>,
	disable_custom_gas_oracle: bool,
	busy: Arc<DashSet<String>>,
}

impl TxDeliveryMan {
	pub fn new(
		endpoints: Vec<EndpointHandle>,
		signer: Arc<dyn SignerInterface>,
		coordinator: Arc<TxNonceCoordinator>,
		options: DeliveryOptions,
	) -> Result<Self, DeliveryError> {
		if endpoints.is_empty() {
			return Err(DeliveryError::Config(
				"Delivery needs at least one endpoint".to_string(),
			));
		}
		options.validate().map_err(DeliveryError::Config)?;
		if coordinator.address() != signer.address() {
			return Err(DeliveryError::Config(format!(
				"Nonce coordinator tracks {} but signer is {}",
				coordinator.address(),
				signer.address()
			)));
		}
		Ok(Self {
			endpoints,
			signer,
			coordinator,
			options: Arc::new(options),
			oracles: Arc::new(GasOracles::new()),
			metrics: Arc::new(NoopMetrics),
			disable_custom_gas_oracle: false,
			busy: Arc::new(DashSet::new()),
		})
	}

	pub fn with_oracles(mut self, oracles: GasOracles) -> Self {
		self.oracles = Arc::new(oracles);
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
		self.metrics = metrics;
		self
	}

	/// Ignores registered gas oracles for every delivery of this instance.
	pub fn without_custom_gas_oracle(mut self) -> Self {
		self.disable_custom_gas_oracle = true;
		self
	}

	pub fn endpoints(&self) -> &[EndpointHandle] {
		&self.endpoints
	}

	pub fn coordinator(&self) -> &Arc<TxNonceCoordinator> {
		&self.coordinator
	}

	/// Returns true while the endpoint is delivering a transaction.
	pub fn is_busy(&self, label: &str) -> bool {
		self.busy.contains(label)
	}

	/// Delivers `request` through every idle endpoint.
	///
	/// # Errors
	///
	/// [`DeliveryError::AllFailed`] with one entry per endpoint when no
	/// endpoint delivered, including endpoints skipped as busy.
	pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
		let nonce = self.coordinator.allocate_nonce().await?;
		tracing::info!(nonce = nonce, to = %request.to, endpoints = self.endpoints.len(), "Delivering transaction");

		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut errors = Vec::new();
		for endpoint in &self.endpoints {
			let label = endpoint.label().to_string();
			if !self.busy.insert(label.clone()) {
				let error = DeliveryError::Busy(label.clone());
				tracing::warn!("{}", error);
				errors.push((label, error));
				continue;
			}
			let guard = BusyGuard {
				busy: self.busy.clone(),
				label: label.clone(),
			};

			let mut context = DeliveryContext::new(endpoint.clone(), self.options.clone());
			context.disable_custom_gas_oracle = self.disable_custom_gas_oracle;
			let delivery = TxDelivery::new(context, self.signer.clone(), self.coordinator.clone())
				.with_oracles(self.oracles.clone())
				.with_metrics(self.metrics.clone());
			let request = request.clone();
			let tx = tx.clone();
			tokio::spawn(async move {
				let _guard = guard;
				let result = delivery.deliver_at(&request, nonce).await;
				let _ = tx.send((label, result));
			});
		}
		drop(tx);

		while let Some((label, result)) = rx.recv().await {
			match result {
				Ok(receipt) => {
					tracing::info!(endpoint = %label, nonce = nonce, attempts = receipt.attempts, "Delivery succeeded");
					return Ok(receipt);
				},
				Err(error) => {
					tracing::warn!(endpoint = %label, nonce = nonce, error = %error, "Delivery failed");
					errors.push((label, error));
				},
			}
		}
		Err(DeliveryError::AllFailed(errors))
	}

	/// Looks up receipts for `hashes` on every endpoint.
	///
	/// Replacements share a nonce, so at most one of them can be mined. Two
	/// different mined hashes mean the endpoints follow different forks.
	pub async fn wait_for_receipts(&self, hashes: &[B256]) -> Result<TransactionReceipt, DeliveryError> {
		let timeout = self.options.expected_delivery_time();
		let lookups = self.endpoints.iter().flat_map(|endpoint| {
			hashes.iter().map(move |hash| async move {
				with_timeout(timeout, endpoint.get_transaction_receipt(*hash)).await
			})
		});

		let mut mined: Vec<TransactionReceipt> = Vec::new();
		for result in join_all(lookups).await {
			match result {
				Ok(Some(receipt)) if receipt.block_number.is_some() => {
					if !mined.iter().any(|m| m.transaction_hash == receipt.transaction_hash) {
						mined.push(receipt);
					}
				},
				Ok(_) => {},
				Err(error) => tracing::debug!(error = %error, "Receipt lookup failed"),
			}
		}

		match mined.len() {
			0 => Err(DeliveryError::NoReceipt(hashes.len())),
			1 => Ok(mined.remove(0)),
			_ => {
				let hashes: Vec<B256> = mined.iter().map(|m| m.transaction_hash).collect();
				tracing::error!(hashes = ?hashes, "Network between rpcs is forked");
				Err(DeliveryError::Forked(hashes))
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{delivery_options, nonce_options, signer};
	use crate::NonceFetcher;
	use relayer_rpc::testing::MockEndpoint;
	use relayer_rpc::RpcError;
	use relayer_types::Address;
	use std::time::Duration;

	fn delivery_man(mocks: &[Arc<MockEndpoint>]) -> TxDeliveryMan {
		let endpoints: Vec<EndpointHandle> = mocks
			.iter()
			.enumerate()
			.map(|(i, mock)| mock.handle(&format!("rpc-{}", i)))
			.collect();
		let signer = signer();
		let options = nonce_options(false);
		let fetcher = NonceFetcher::new(endpoints.clone(), &options).unwrap();
		let coordinator = Arc::new(TxNonceCoordinator::new(signer.address(), fetcher, options));
		TxDeliveryMan::new(endpoints, signer, coordinator, delivery_options()).unwrap()
	}

	fn request() -> DeliveryRequest {
		DeliveryRequest::new(Address::repeat_byte(0x33), vec![0x01])
	}

	#[tokio::test(start_paused = true)]
	async fn test_first_success_wins() {
		let failing = MockEndpoint::new(1);
		failing.push_send_result(Some(RpcError::Rpc {
			code: -32000,
			message: "internal error".into(),
		}));
		let healthy = MockEndpoint::new(1);
		healthy.with_state(|s| s.mine_on_send = true);

		let man = delivery_man(&[failing.clone(), healthy.clone()]);
		let receipt = man.deliver(request()).await.unwrap();
		assert_eq!(receipt.endpoint, "rpc-1");
		assert_eq!(receipt.nonce, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_success_wins_over_nonce_and_timeout_rejections() {
		let losing_errors = [
			RpcError::Rpc {
				code: -32000,
				message: "nonce too low".into(),
			},
			RpcError::Timeout(Duration::from_secs(1)),
		];
		for error in losing_errors {
			let failing = MockEndpoint::new(1);
			failing.push_send_result(Some(error.clone()));
			let healthy = MockEndpoint::new(1);
			healthy.with_state(|s| s.mine_on_send = true);

			let man = delivery_man(&[failing, healthy]);
			let receipt = man.deliver(request()).await.unwrap();
			assert_eq!(receipt.endpoint, "rpc-1", "losing error: {}", error);
			assert_eq!(receipt.nonce, 0);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_all_failed_collects_every_endpoint() {
		let mocks: Vec<_> = (0..2).map(|_| MockEndpoint::new(1)).collect();
		for mock in &mocks {
			mock.push_send_result(Some(RpcError::Rpc {
				code: -32000,
				message: "insufficient funds for transfer".into(),
			}));
		}

		let man = delivery_man(&mocks);
		match man.deliver(request()).await {
			Err(DeliveryError::AllFailed(errors)) => {
				assert_eq!(errors.len(), 2);
				assert!(errors
					.iter()
					.all(|(_, e)| matches!(e, DeliveryError::InsufficientFunds(_))));
			},
			other => panic!("unexpected result: {:?}", other),
		}
		assert!(!man.is_busy("rpc-0"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_busy_endpoint_is_skipped() {
		let slow = MockEndpoint::new(1);
		let fast = MockEndpoint::new(1);
		fast.with_state(|s| s.mine_on_send = true);
		let man = delivery_man(&[slow, fast]);

		// rpc-0 never mines, so its delivery keeps it busy for three attempts.
		let first = man.deliver(request()).await.unwrap();
		assert_eq!(first.endpoint, "rpc-1");
		assert!(man.is_busy("rpc-0"));

		let second = man.deliver(request()).await.unwrap();
		assert_eq!(second.endpoint, "rpc-1");
		assert_eq!(second.nonce, 1);

		tokio::time::sleep(Duration::from_secs(10)).await;
		assert!(!man.is_busy("rpc-0"));
	}

	#[tokio::test]
	async fn test_fork_detection() {
		let a = MockEndpoint::new(1);
		let b = MockEndpoint::new(1);
		let (first, second) = (B256::repeat_byte(1), B256::repeat_byte(2));
		a.insert_receipt(first, 10);
		b.insert_receipt(second, 10);
		let man = delivery_man(&[a.clone(), b]);

		assert!(matches!(
			man.wait_for_receipts(&[first, second]).await,
			Err(DeliveryError::Forked(hashes)) if hashes.len() == 2
		));

		let man = delivery_man(&[a, MockEndpoint::new(1)]);
		let receipt = man.wait_for_receipts(&[first, second]).await.unwrap();
		assert_eq!(receipt.transaction_hash, first);

		assert!(matches!(
			man.wait_for_receipts(&[B256::repeat_byte(9)]).await,
			Err(DeliveryError::NoReceipt(1))
		));
	}

	#[test]
	fn test_rejects_mismatched_signer() {
		let mock = MockEndpoint::new(1);
		let options = nonce_options(false);
		let fetcher = NonceFetcher::new(vec![mock.handle("rpc-0")], &options).unwrap();
		let coordinator = Arc::new(TxNonceCoordinator::new(Address::ZERO, fetcher, options));
		assert!(TxDeliveryMan::new(vec![mock.handle("rpc-0")], signer(), coordinator, delivery_options()).is_err());
	}
}
