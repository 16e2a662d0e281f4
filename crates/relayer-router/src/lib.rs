//! Multi-endpoint read routing for the relayer system.
//!
//! Two strategies turn a set of independent endpoints into one endpoint:
//! [`FallbackRouter`] sends every read to one active endpoint and fails over
//! on recoverable errors, while [`AgreementRouter`] additionally elects a
//! block number and only accepts call results that a quorum of endpoints
//! agree on. Both implement `EndpointInterface`, so they can be used wherever
//! a single endpoint is expected.

use relayer_rpc::RpcError;
use relayer_types::RpcErrorKind;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod agreement;
pub mod curated;
pub mod election;
pub mod fallback;

pub use agreement::AgreementRouter;
pub use curated::CuratedRpcList;
pub use election::{elect_rounded_median, ElectedBlock, ElectionFn};
pub use fallback::FallbackRouter;

/// An error returned by one endpoint during a routed operation.
#[derive(Debug, Clone)]
pub struct EndpointFailure {
	pub endpoint: String,
	pub error: RpcError,
}

impl fmt::Display for EndpointFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "RpcUrl={} {}", self.endpoint, self.error)
	}
}

/// Details of a quorum operation that did not reach agreement.
#[derive(Debug, Clone)]
pub struct AgreementFailure {
	pub operation: String,
	/// Block the operation was pinned to.
	pub block: Option<u64>,
	pub quorum: usize,
	/// Number of endpoints that returned a value.
	pub successes: usize,
	/// Every distinct value with its vote count, in order of first arrival.
	pub results: Vec<(String, usize)>,
	pub errors: Vec<EndpointFailure>,
	/// Whether the message includes the result map.
	pub show_results: bool,
}

impl fmt::Display for AgreementFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"operation={} Failed to find at least {} agreeing providers",
			self.operation, self.quorum
		)?;
		if let Some(block) = self.block {
			write!(f, " at block {}", block)?;
		}
		write!(f, "; {} providers responded with success", self.successes)?;
		if self.show_results {
			let results: Vec<String> = self
				.results
				.iter()
				.map(|(value, count)| format!("{}: {}", value, count))
				.collect();
			write!(f, "; Providers results: {{{}}}", results.join(", "))?;
		}
		if !self.errors.is_empty() {
			let errors: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
			write!(f, "; Errors: [{}]", errors.join("; "))?;
		}
		Ok(())
	}
}

/// Errors that can occur while routing an operation.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	/// The error of the last endpoint tried.
	#[error("RpcUrl={endpoint} {source}")]
	Endpoint {
		endpoint: String,
		#[source]
		source: RpcError,
	},
	#[error("operation={operation} timed out after {after:?}")]
	Timeout { operation: String, after: Duration },
	#[error("{}", all_failed_message(.operation, .errors))]
	AllFailed {
		operation: String,
		errors: Vec<EndpointFailure>,
	},
	#[error("{0}")]
	Agreement(AgreementFailure),
}

fn all_failed_message(operation: &str, errors: &[EndpointFailure]) -> String {
	let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
	format!(
		"All providers failed to fetch '{}': [{}]",
		operation,
		errors.join("; ")
	)
}

impl RouterError {
	/// Classification of the underlying endpoint error, if there is exactly one.
	pub fn kind(&self) -> Option<RpcErrorKind> {
		match self {
			RouterError::Endpoint { source, .. } => Some(source.kind()),
			RouterError::Timeout { .. } => Some(RpcErrorKind::Timeout),
			RouterError::InvalidArgument(_) => Some(RpcErrorKind::InvalidArgument),
			_ => None,
		}
	}
}

impl From<RouterError> for RpcError {
	fn from(err: RouterError) -> Self {
		match err {
			RouterError::Endpoint { source, .. } => source,
			RouterError::Timeout { after, .. } => RpcError::Timeout(after),
			RouterError::InvalidArgument(message) | RouterError::Config(message) => {
				RpcError::InvalidArgument(message)
			},
			other => RpcError::Aggregate(other.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_agreement_failure_message() {
		let failure = AgreementFailure {
			operation: "call".into(),
			block: Some(100),
			quorum: 2,
			successes: 3,
			results: vec![("0x01".into(), 1), ("0x02".into(), 1), ("0x03".into(), 1)],
			errors: vec![EndpointFailure {
				endpoint: "http://d".into(),
				error: RpcError::Transport("connection refused".into()),
			}],
			show_results: true,
		};
		let message = failure.to_string();
		assert!(message.starts_with(
			"operation=call Failed to find at least 2 agreeing providers at block 100; 3 providers responded with success"
		));
		assert!(message.contains("Providers results: {0x01: 1, 0x02: 1, 0x03: 1}"));
		assert!(message.contains("RpcUrl=http://d Transport error: connection refused"));

		let hidden = AgreementFailure {
			show_results: false,
			..failure
		};
		assert!(!hidden.to_string().contains("Providers results"));
	}

	#[test]
	fn test_endpoint_error_keeps_classification() {
		let err = RouterError::Endpoint {
			endpoint: "http://a".into(),
			source: RpcError::Rpc {
				code: -32000,
				message: "nonce too low".into(),
			},
		};
		assert_eq!(err.kind(), Some(RpcErrorKind::NonceExpired));
		assert_eq!(RpcError::from(err).kind(), RpcErrorKind::NonceExpired);
	}

	#[test]
	fn test_all_failed_message() {
		let err = RouterError::AllFailed {
			operation: "getBlockNumber".into(),
			errors: vec![EndpointFailure {
				endpoint: "http://a".into(),
				error: RpcError::Timeout(Duration::from_millis(1500)),
			}],
		};
		assert!(err
			.to_string()
			.starts_with("All providers failed to fetch 'getBlockNumber'"));
	}
}
