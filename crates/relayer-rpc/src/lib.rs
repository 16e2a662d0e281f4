//! Endpoint abstraction for the relayer system.
//!
//! This module defines the chain-read capability every RPC endpoint exposes,
//! the cheap cloneable [`EndpointHandle`] routers and delivery code pass
//! around, and the [`RpcError`] type whose [`RpcError::kind`] drives failover
//! and fee rescaling decisions.

use async_trait::async_trait;
use relayer_types::{
	Address, BlockHeader, BlockTag, Bytes, CallRequest, FeeHistory, ImplementationRegistry,
	RpcErrorKind, TransactionReceipt, B256, U256,
};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod events;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export implementations
pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
}

pub use events::{ChainEvent, EventType, Listener, ListenerSet};

/// Errors returned by endpoint operations.
///
/// Errors are cloneable so aggregate failures can keep every constituent
/// error while the same error is also logged or reported.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
	#[error("Request timed out after {0:?}")]
	Timeout(Duration),
	#[error("Transport error: {0}")]
	Transport(String),
	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	#[error("Cancelled: {0}")]
	Cancelled(String),
	#[error("{0}")]
	Aggregate(String),
	#[error("Unsupported operation: {0}")]
	Unsupported(String),
}

impl RpcError {
	/// Classifies the error for failover and delivery decisions.
	pub fn kind(&self) -> RpcErrorKind {
		match self {
			RpcError::Timeout(_) => RpcErrorKind::Timeout,
			RpcError::Transport(message) => match classify(None, message) {
				RpcErrorKind::RateLimit => RpcErrorKind::RateLimit,
				_ => RpcErrorKind::Transport,
			},
			RpcError::Rpc { code, message } => classify(Some(*code), message),
			RpcError::InvalidArgument(_) => RpcErrorKind::InvalidArgument,
			RpcError::Cancelled(_) => RpcErrorKind::Transport,
			RpcError::InvalidResponse(_) | RpcError::Aggregate(_) | RpcError::Unsupported(_) => {
				RpcErrorKind::Server
			},
		}
	}
}

/// Classifies a JSON-RPC error from its code and message.
///
/// Node implementations disagree on codes for transaction pool rejections, so
/// message fragments take precedence and codes only decide what is left.
pub fn classify(code: Option<i64>, message: &str) -> RpcErrorKind {
	let msg = message.to_ascii_lowercase();
	let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

	if code == Some(3) || has(&["execution reverted", "vm exception", "revert"]) {
		return RpcErrorKind::ExecutionReverted;
	}
	if has(&["insufficient funds"]) {
		return RpcErrorKind::InsufficientFunds;
	}
	if has(&[
		"nonce too low",
		"nonce has already been used",
		"invalid nonce",
		"invalid sequence",
		"nonce expired",
	]) {
		return RpcErrorKind::NonceExpired;
	}
	if has(&["already known", "known transaction", "already imported"]) {
		return RpcErrorKind::AlreadyKnown;
	}
	if has(&[
		"underpriced",
		"maxfeepergas",
		"basefeepergas",
		"max fee per gas less than block base fee",
		"fee too low",
	]) {
		return RpcErrorKind::ReplacementUnderpriced;
	}
	if matches!(code, Some(429) | Some(-32005)) || has(&["rate limit", "too many requests"]) {
		return RpcErrorKind::RateLimit;
	}
	match code {
		Some(-32700) | Some(-32600) | Some(-32602) => RpcErrorKind::InvalidArgument,
		_ => RpcErrorKind::Server,
	}
}

/// Runs `fut` with a deadline, mapping expiry to [`RpcError::Timeout`].
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, RpcError>
where
	F: Future<Output = Result<T, RpcError>>,
{
	tokio::time::timeout(duration, fut)
		.await
		.unwrap_or(Err(RpcError::Timeout(duration)))
}

/// Chain-read and broadcast capability of one RPC endpoint.
///
/// Routers implement this trait as well, so anything that accepts an
/// endpoint can be handed a fallback or agreement router instead.
#[async_trait]
pub trait EndpointInterface: Send + Sync {
	async fn get_chain_id(&self) -> Result<u64, RpcError>;

	async fn get_block_number(&self) -> Result<u64, RpcError>;

	/// Returns the block header for `tag`, or `None` if the node does not know it.
	async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>, RpcError>;

	async fn get_transaction_count(&self, address: Address, tag: BlockTag)
		-> Result<u64, RpcError>;

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, RpcError>;

	/// Executes a read-only call at `tag` and returns the raw result bytes.
	async fn call(&self, request: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError>;

	async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError>;

	async fn get_gas_price(&self) -> Result<u128, RpcError>;

	async fn get_max_priority_fee_per_gas(&self) -> Result<u128, RpcError>;

	async fn get_fee_history(
		&self,
		block_count: u64,
		newest_block: BlockTag,
		reward_percentiles: &[f64],
	) -> Result<FeeHistory, RpcError>;

	async fn get_transaction_receipt(
		&self,
		hash: B256,
	) -> Result<Option<TransactionReceipt>, RpcError>;

	/// Broadcasts a signed transaction and returns its hash.
	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError>;

	/// Registers a listener that fires on every matching event.
	fn on(&self, event: EventType, listener: Listener);

	/// Registers a listener that fires at most once.
	fn once(&self, event: EventType, listener: Listener);

	/// Removes one listener, or every listener of `event` when `listener` is `None`.
	fn off(&self, event: &EventType, listener: Option<&Listener>);

	/// Removes every listener of `event`, or every listener at all.
	fn remove_all_listeners(&self, event: Option<&EventType>);
}

/// Type alias for endpoint factory functions.
///
/// This is the function signature that all endpoint implementations must
/// provide to create instances of their endpoint interface.
pub type EndpointFactory = fn(&toml::Value) -> Result<Box<dyn EndpointInterface>, RpcError>;

/// Registry trait for endpoint implementations.
pub trait EndpointRegistry: ImplementationRegistry<Factory = EndpointFactory> {}

/// Get all registered endpoint implementations.
///
/// Returns a vector of (name, factory) tuples for all available endpoint
/// implementations.
pub fn get_all_implementations() -> Vec<(&'static str, EndpointFactory)> {
	use implementations::evm::alloy;

	vec![(alloy::Registry::NAME, alloy::Registry::factory())]
}

/// A labelled endpoint bound to a chain.
///
/// Handles are immutable and cheap to clone; the underlying connection is
/// shared.
#[derive(Clone)]
pub struct EndpointHandle {
	label: Arc<str>,
	chain_id: u64,
	inner: Arc<dyn EndpointInterface>,
}

impl EndpointHandle {
	pub fn new(label: impl Into<String>, chain_id: u64, inner: Arc<dyn EndpointInterface>) -> Self {
		Self {
			label: Arc::from(label.into()),
			chain_id,
			inner,
		}
	}

	/// Label used in logs, metrics and error messages, usually the URL.
	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn chain_id(&self) -> u64 {
		self.chain_id
	}

	pub fn inner(&self) -> &Arc<dyn EndpointInterface> {
		&self.inner
	}
}

impl Deref for EndpointHandle {
	type Target = dyn EndpointInterface;

	fn deref(&self) -> &Self::Target {
		self.inner.as_ref()
	}
}

impl fmt::Debug for EndpointHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EndpointHandle")
			.field("label", &self.label)
			.field("chain_id", &self.chain_id)
			.finish()
	}
}
