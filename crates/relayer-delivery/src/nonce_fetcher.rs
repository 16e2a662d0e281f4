//! Account nonce reads across every configured endpoint.

use crate::DeliveryError;
use futures::future::join_all;
use relayer_router::{AgreementFailure, EndpointFailure, RouterError};
use relayer_rpc::{with_timeout, EndpointHandle};
use relayer_types::{Address, BlockTag, NonceOptions};
use std::time::Duration;

/// Below this many endpoints the highest reported nonce wins; from here on a
/// quorum of endpoints has to agree.
pub const MIN_PROVIDERS_FOR_AGREEMENT: usize = 3;

const OPERATION: &str = "getTransactionCount";

/// Reads an account nonce from all endpoints at once.
#[derive(Debug, Clone)]
pub struct NonceFetcher {
	endpoints: Vec<EndpointHandle>,
	quorum: usize,
	timeout: Duration,
}

impl NonceFetcher {
	pub fn new(endpoints: Vec<EndpointHandle>, options: &NonceOptions) -> Result<Self, DeliveryError> {
		if endpoints.is_empty() {
			return Err(DeliveryError::Config(
				"Nonce fetcher needs at least one endpoint".to_string(),
			));
		}
		Ok(Self {
			endpoints,
			quorum: options.quorum.max(1),
			timeout: options.single_call_timeout(),
		})
	}

	pub fn endpoints(&self) -> &[EndpointHandle] {
		&self.endpoints
	}

	/// Fetches the nonce of `address` at `tag`.
	///
	/// With fewer than [`MIN_PROVIDERS_FOR_AGREEMENT`] endpoints this is the
	/// maximum over the endpoints that answered; it only fails when every
	/// endpoint fails. With more endpoints the first value reported by at
	/// least `quorum` endpoints is returned.
	pub async fn fetch(&self, address: Address, tag: BlockTag) -> Result<u64, DeliveryError> {
		let results = join_all(self.endpoints.iter().map(|endpoint| async move {
			let result = with_timeout(self.timeout, endpoint.get_transaction_count(address, tag)).await;
			(endpoint.label().to_string(), result)
		}))
		.await;

		let mut values = Vec::new();
		let mut errors = Vec::new();
		for (endpoint, result) in results {
			match result {
				Ok(nonce) => values.push(nonce),
				Err(error) => {
					tracing::debug!(endpoint = %endpoint, error = %error, "Nonce fetch failed");
					errors.push(EndpointFailure { endpoint, error });
				},
			}
		}

		if values.is_empty() {
			return Err(RouterError::AllFailed {
				operation: OPERATION.to_string(),
				errors,
			}
			.into());
		}

		if self.endpoints.len() < MIN_PROVIDERS_FOR_AGREEMENT {
			return Ok(values.into_iter().max().unwrap_or_default());
		}

		let mut votes: Vec<(u64, usize)> = Vec::new();
		for value in &values {
			match votes.iter_mut().find(|(candidate, _)| candidate == value) {
				Some((_, count)) => *count += 1,
				None => votes.push((*value, 1)),
			}
		}
		if let Some((nonce, _)) = votes.iter().find(|(_, count)| *count >= self.quorum) {
			return Ok(*nonce);
		}

		Err(RouterError::Agreement(AgreementFailure {
			operation: OPERATION.to_string(),
			block: None,
			quorum: self.quorum,
			successes: values.len(),
			results: votes
				.into_iter()
				.map(|(value, count)| (value.to_string(), count))
				.collect(),
			errors,
			show_results: true,
		})
		.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relayer_rpc::testing::MockEndpoint;
	use relayer_rpc::RpcError;

	fn fetcher(nonces: &[Option<u64>]) -> NonceFetcher {
		let endpoints = nonces
			.iter()
			.enumerate()
			.map(|(i, nonce)| {
				let mock = MockEndpoint::new(1);
				match nonce {
					Some(n) => mock.set_nonce(*n),
					None => mock.fail_all(RpcError::Transport("connection refused".into())),
				}
				mock.handle(&format!("rpc-{}", i))
			})
			.collect();
		NonceFetcher::new(endpoints, &NonceOptions::default()).unwrap()
	}

	#[tokio::test]
	async fn test_few_endpoints_take_maximum() {
		let address = Address::repeat_byte(1);
		assert_eq!(fetcher(&[Some(3), Some(5)]).fetch(address, BlockTag::Latest).await.unwrap(), 5);
		assert_eq!(fetcher(&[Some(3), None]).fetch(address, BlockTag::Latest).await.unwrap(), 3);
	}

	#[tokio::test]
	async fn test_fails_only_when_every_endpoint_fails() {
		let error = fetcher(&[None, None])
			.fetch(Address::ZERO, BlockTag::Pending)
			.await
			.unwrap_err();
		assert!(error
			.to_string()
			.starts_with("All providers failed to fetch 'getTransactionCount'"));
	}

	#[tokio::test]
	async fn test_quorum_with_enough_endpoints() {
		let address = Address::ZERO;
		assert_eq!(
			fetcher(&[Some(5), Some(4), Some(5)]).fetch(address, BlockTag::Latest).await.unwrap(),
			5
		);
		assert_eq!(
			fetcher(&[Some(5), None, Some(5)]).fetch(address, BlockTag::Latest).await.unwrap(),
			5
		);
		assert!(matches!(
			fetcher(&[Some(5), Some(4), Some(3)]).fetch(address, BlockTag::Latest).await,
			Err(DeliveryError::Router(RouterError::Agreement(_)))
		));
	}

	#[test]
	fn test_requires_an_endpoint() {
		assert!(NonceFetcher::new(vec![], &NonceOptions::default()).is_err());
	}
}
