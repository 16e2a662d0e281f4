//! HTTP endpoint implementation backed by Alloy.
//!
//! Typed provider calls are used where Alloy offers them; block headers,
//! receipts and raw broadcasts go through `raw_request` and are reduced to
//! the relayer's own response types. Chain events are produced by a poller
//! that only runs while listeners are registered.

use crate::{ChainEvent, EndpointInterface, EventType, Listener, ListenerSet, RpcError};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types::{BlockId, BlockNumberOrTag, TransactionRequest};
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use async_trait::async_trait;
use relayer_types::{
	Address, BlockHeader, BlockTag, Bytes, CallRequest, ConfigSchema, FeeHistory, Field,
	FieldType, Schema, TransactionReceipt, ValidationError, B256, U256,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type HttpProvider = RootProvider<Http<reqwest::Client>>;

const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;

/// Alloy-based JSON-RPC endpoint over HTTP.
pub struct AlloyEndpoint {
	url: String,
	provider: HttpProvider,
	listeners: Arc<ListenerSet>,
	poll_interval: Duration,
	poller: Mutex<Option<JoinHandle<()>>>,
}

impl AlloyEndpoint {
	/// Creates an endpoint for `url`.
	///
	/// No request is made until the first call.
	pub fn new(url: &str, poll_interval: Duration) -> Result<Self, RpcError> {
		let parsed: reqwest::Url = url
			.parse()
			.map_err(|e| RpcError::InvalidArgument(format!("Invalid RPC URL {}: {}", url, e)))?;
		let provider = ProviderBuilder::new().on_http(parsed);

		Ok(Self {
			url: url.to_string(),
			provider,
			listeners: Arc::new(ListenerSet::new()),
			poll_interval,
			poller: Mutex::new(None),
		})
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	/// Starts the event poller unless it is already running.
	fn ensure_poller(&self) {
		let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
		if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
			return;
		}
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			tracing::warn!(url = %self.url, "No async runtime, chain events will not be polled");
			return;
		};
		*poller = Some(runtime.spawn(poll_events(
			self.provider.clone(),
			Arc::downgrade(&self.listeners),
			self.poll_interval,
			self.url.clone(),
		)));
	}
}

impl Drop for AlloyEndpoint {
	fn drop(&mut self) {
		if let Some(handle) = self
			.poller
			.get_mut()
			.unwrap_or_else(|e| e.into_inner())
			.take()
		{
			handle.abort();
		}
	}
}

async fn poll_events(
	provider: HttpProvider,
	listeners: Weak<ListenerSet>,
	interval: Duration,
	url: String,
) {
	let mut last_block: Option<u64> = None;
	loop {
		tokio::time::sleep(interval).await;
		let Some(listeners) = listeners.upgrade() else {
			break;
		};
		if listeners.is_empty() {
			continue;
		}

		if listeners.has(&EventType::Block) {
			match provider.get_block_number().await {
				Ok(number) if last_block.is_none_or(|last| number > last) => {
					last_block = Some(number);
					listeners.emit(&ChainEvent::Block(number));
				},
				Ok(_) => {},
				Err(e) => tracing::debug!(url = %url, error = %e, "Block poll failed"),
			}
		}

		let watched: HashSet<B256> = listeners
			.entries()
			.into_iter()
			.filter_map(|entry| match entry.event {
				EventType::Transaction(hash) => Some(hash),
				EventType::Block => None,
			})
			.collect();
		for hash in watched {
			match fetch_receipt(&provider, hash).await {
				Ok(Some(receipt)) => {
					listeners.emit(&ChainEvent::Transaction(receipt));
				},
				Ok(None) => {},
				Err(e) => tracing::debug!(url = %url, tx_hash = %hash, error = %e, "Receipt poll failed"),
			}
		}
	}
}

/// Maps a transport error onto [`RpcError`], keeping JSON-RPC codes.
fn map_error(err: TransportError) -> RpcError {
	if let Some(payload) = err.as_error_resp() {
		return RpcError::Rpc {
			code: payload.code,
			message: payload.message.to_string(),
		};
	}
	if err.is_transport_error() {
		return RpcError::Transport(err.to_string());
	}
	RpcError::InvalidResponse(err.to_string())
}

fn block_id(tag: BlockTag) -> BlockId {
	BlockId::Number(block_number_or_tag(tag))
}

fn block_number_or_tag(tag: BlockTag) -> BlockNumberOrTag {
	match tag {
		BlockTag::Latest => BlockNumberOrTag::Latest,
		BlockTag::Pending => BlockNumberOrTag::Pending,
		BlockTag::Number(number) => BlockNumberOrTag::Number(number),
	}
}

fn to_transaction_request(request: &CallRequest) -> TransactionRequest {
	let mut tx = TransactionRequest::default().input(request.data.clone().into());
	if let Some(to) = request.to {
		tx = tx.to(to);
	}
	if let Some(from) = request.from {
		tx = tx.from(from);
	}
	if let Some(value) = request.value {
		tx = tx.value(value);
	}
	tx
}

/// Parses a hex quantity field such as `"0x1a"`.
fn quantity(object: &Value, field: &str) -> Result<Option<u128>, RpcError> {
	match object.get(field) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(s)) => {
			let digits = s.strip_prefix("0x").unwrap_or(s);
			u128::from_str_radix(digits, 16).map(Some).map_err(|e| {
				RpcError::InvalidResponse(format!("Invalid quantity in {}: {}", field, e))
			})
		},
		Some(other) => Err(RpcError::InvalidResponse(format!(
			"Expected hex string in {}, got {}",
			field, other
		))),
	}
}

fn required_u64(object: &Value, field: &str) -> Result<u64, RpcError> {
	quantity(object, field)?
		.and_then(|v| u64::try_from(v).ok())
		.ok_or_else(|| RpcError::InvalidResponse(format!("Missing or invalid field {}", field)))
}

fn parse_block(value: &Value) -> Result<BlockHeader, RpcError> {
	Ok(BlockHeader {
		number: required_u64(value, "number")?,
		timestamp: required_u64(value, "timestamp")?,
		base_fee_per_gas: quantity(value, "baseFeePerGas")?,
	})
}

fn parse_receipt(value: &Value) -> Result<TransactionReceipt, RpcError> {
	let transaction_hash = value
		.get("transactionHash")
		.and_then(Value::as_str)
		.ok_or_else(|| RpcError::InvalidResponse("Receipt without transactionHash".into()))?
		.parse::<B256>()
		.map_err(|e| RpcError::InvalidResponse(format!("Invalid transactionHash: {}", e)))?;
	let block_number = quantity(value, "blockNumber")?.and_then(|n| u64::try_from(n).ok());
	// Pre-Byzantium receipts carry a state root instead of a status.
	let status = quantity(value, "status")?.map(|s| s == 1).unwrap_or(true);

	Ok(TransactionReceipt {
		transaction_hash,
		block_number,
		status,
	})
}

async fn fetch_receipt(
	provider: &HttpProvider,
	hash: B256,
) -> Result<Option<TransactionReceipt>, RpcError> {
	let value: Option<Value> = provider
		.raw_request("eth_getTransactionReceipt".into(), (hash,))
		.await
		.map_err(map_error)?;
	value.as_ref().map(parse_receipt).transpose()
}

#[async_trait]
impl EndpointInterface for AlloyEndpoint {
	async fn get_chain_id(&self) -> Result<u64, RpcError> {
		self.provider.get_chain_id().await.map_err(map_error)
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.provider.get_block_number().await.map_err(map_error)
	}

	async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>, RpcError> {
		let value: Option<Value> = self
			.provider
			.raw_request("eth_getBlockByNumber".into(), (tag.to_string(), false))
			.await
			.map_err(map_error)?;
		value.as_ref().map(parse_block).transpose()
	}

	async fn get_transaction_count(
		&self,
		address: Address,
		tag: BlockTag,
	) -> Result<u64, RpcError> {
		self.provider
			.get_transaction_count(address)
			.block_id(block_id(tag))
			.await
			.map_err(map_error)
	}

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, RpcError> {
		self.provider
			.get_balance(address)
			.block_id(block_id(tag))
			.await
			.map_err(map_error)
	}

	async fn call(&self, request: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError> {
		let tx = to_transaction_request(request);
		self.provider
			.call(&tx)
			.block(block_id(tag))
			.await
			.map_err(map_error)
	}

	async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
		let tx = to_transaction_request(request);
		self.provider.estimate_gas(&tx).await.map_err(map_error)
	}

	async fn get_gas_price(&self) -> Result<u128, RpcError> {
		self.provider.get_gas_price().await.map_err(map_error)
	}

	async fn get_max_priority_fee_per_gas(&self) -> Result<u128, RpcError> {
		self.provider
			.get_max_priority_fee_per_gas()
			.await
			.map_err(map_error)
	}

	async fn get_fee_history(
		&self,
		block_count: u64,
		newest_block: BlockTag,
		reward_percentiles: &[f64],
	) -> Result<FeeHistory, RpcError> {
		let history = self
			.provider
			.get_fee_history(
				block_count,
				block_number_or_tag(newest_block),
				reward_percentiles,
			)
			.await
			.map_err(map_error)?;

		Ok(FeeHistory {
			oldest_block: history.oldest_block,
			base_fee_per_gas: history.base_fee_per_gas,
			reward: history.reward.unwrap_or_default(),
		})
	}

	async fn get_transaction_receipt(
		&self,
		hash: B256,
	) -> Result<Option<TransactionReceipt>, RpcError> {
		fetch_receipt(&self.provider, hash).await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
		let hash: B256 = self
			.provider
			.raw_request("eth_sendRawTransaction".into(), (raw,))
			.await
			.map_err(map_error)?;
		tracing::debug!(url = %self.url, tx_hash = %hash, "Broadcast raw transaction");
		Ok(hash)
	}

	fn on(&self, event: EventType, listener: Listener) {
		self.listeners.add(event, listener, false);
		self.ensure_poller();
	}

	fn once(&self, event: EventType, listener: Listener) {
		self.listeners.add(event, listener, true);
		self.ensure_poller();
	}

	fn off(&self, event: &EventType, listener: Option<&Listener>) {
		self.listeners.remove(event, listener);
	}

	fn remove_all_listeners(&self, event: Option<&EventType>) {
		self.listeners.clear(event);
	}
}

/// Configuration schema for the HTTP endpoint.
pub struct AlloyEndpointSchema;

impl AlloyEndpointSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		Self.validate(config)
	}
}

impl ConfigSchema for AlloyEndpointSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
					_ => Err("url must be an http(s) URL".to_string()),
				}
			})],
			vec![Field::new(
				"poll_interval_ms",
				FieldType::Integer {
					min: Some(10),
					max: None,
				},
			)],
		);

		schema.validate(config)
	}
}

/// Factory function to create an HTTP endpoint from configuration.
///
/// Configuration parameters:
/// - `url`: JSON-RPC endpoint URL (required)
/// - `poll_interval_ms`: event polling interval (default 4000)
pub fn create_http_endpoint(config: &toml::Value) -> Result<Box<dyn EndpointInterface>, RpcError> {
	AlloyEndpointSchema::validate_config(config)
		.map_err(|e| RpcError::InvalidArgument(format!("Invalid configuration: {}", e)))?;

	let url = config
		.get("url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| RpcError::InvalidArgument("url is required".to_string()))?;
	let poll_interval_ms = config
		.get("poll_interval_ms")
		.and_then(|v| v.as_integer())
		.map(|v| v as u64)
		.unwrap_or(DEFAULT_POLL_INTERVAL_MS);

	Ok(Box::new(AlloyEndpoint::new(
		url,
		Duration::from_millis(poll_interval_ms),
	)?))
}

/// Registry for the HTTP endpoint implementation.
pub struct Registry;

impl relayer_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "http";
	type Factory = crate::EndpointFactory;

	fn factory() -> Self::Factory {
		create_http_endpoint
	}
}

impl crate::EndpointRegistry for Registry {}
