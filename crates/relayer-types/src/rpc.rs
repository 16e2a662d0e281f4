//! Chain-read request and response types.
//!
//! These are the endpoint-neutral shapes exchanged between routers, the
//! delivery engine and concrete endpoint implementations.

use alloy_primitives::{hex, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Block reference for state reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BlockTag {
	#[default]
	Latest,
	Pending,
	Number(u64),
}

impl BlockTag {
	/// Returns the block number when the tag pins a concrete block.
	pub fn as_number(&self) -> Option<u64> {
		match self {
			Self::Number(number) => Some(*number),
			_ => None,
		}
	}
}

impl fmt::Display for BlockTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Latest => write!(f, "latest"),
			Self::Pending => write!(f, "pending"),
			Self::Number(number) => write!(f, "{:#x}", number),
		}
	}
}

impl FromStr for BlockTag {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"latest" => Ok(Self::Latest),
			"pending" => Ok(Self::Pending),
			other => {
				let parsed = match other.strip_prefix("0x") {
					Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
					None => other.parse::<u64>(),
				};
				parsed
					.map(Self::Number)
					.map_err(|e| format!("Invalid block tag '{}': {}", s, e))
			},
		}
	}
}

impl TryFrom<String> for BlockTag {
	type Error = String;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<BlockTag> for String {
	fn from(tag: BlockTag) -> Self {
		tag.to_string()
	}
}

/// Read-only call request (`eth_call` / `eth_estimateGas`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
	pub from: Option<Address>,
	pub to: Option<Address>,
	pub data: Bytes,
	pub value: Option<U256>,
}

impl CallRequest {
	/// Creates a call to `to` with the given calldata.
	pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
		Self {
			from: None,
			to: Some(to),
			data: data.into(),
			value: None,
		}
	}

	/// Sets the sender of the call.
	pub fn with_from(mut self, from: Address) -> Self {
		self.from = Some(from);
		self
	}

	/// Cache key built from the normalized request fields and the block reference.
	///
	/// Addresses and calldata are lowercased so checksummed and plain inputs
	/// map to the same entry.
	pub fn cache_key(&self, block: &BlockTag) -> String {
		let address = |a: &Option<Address>| {
			a.map(|a| a.to_string().to_lowercase())
				.unwrap_or_default()
		};
		format!(
			"{}|{}|{}|{}|{}",
			address(&self.from),
			address(&self.to),
			hex::encode(&self.data),
			self.value.map(|v| v.to_string()).unwrap_or_default(),
			block
		)
	}
}

/// Logical transaction a caller asks the relayer to land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCall {
	pub from: Address,
	pub to: Address,
	pub data: Bytes,
	#[serde(default)]
	pub value: U256,
}

impl TxCall {
	/// Converts the call into a read request, used for gas estimation.
	pub fn to_request(&self) -> CallRequest {
		CallRequest {
			from: Some(self.from),
			to: Some(self.to),
			data: self.data.clone(),
			value: (!self.value.is_zero()).then_some(self.value),
		}
	}
}

/// Fully populated transaction ready for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
	pub chain_id: u64,
	pub from: Address,
	pub to: Address,
	pub data: Bytes,
	pub value: U256,
	pub nonce: u64,
	pub gas_limit: u64,
	pub fee: crate::FeeStructure,
}

impl UnsignedTx {
	/// EIP-2718 type byte: 2 for EIP-1559 fees, 0 for a legacy gas price.
	pub fn tx_type(&self) -> u8 {
		match self.fee {
			crate::FeeStructure::Eip1559(_) => 2,
			crate::FeeStructure::Auction(_) => 0,
		}
	}
}

/// Receipt summary of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
	pub transaction_hash: B256,
	pub block_number: Option<u64>,
	/// Whether the transaction executed successfully.
	pub status: bool,
}

/// Header fields of a block the relayer cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
	pub number: u64,
	pub timestamp: u64,
	pub base_fee_per_gas: Option<u128>,
}

/// Result of `eth_feeHistory`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeHistory {
	pub oldest_block: u64,
	pub base_fee_per_gas: Vec<u128>,
	/// Priority fee rewards, one row per block and one column per percentile.
	pub reward: Vec<Vec<u128>>,
}

/// Classification of an endpoint error.
///
/// Routers and the delivery engine decide between failover, rescaling and
/// surfacing an error based on this kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
	/// The call did not complete within its deadline.
	Timeout,
	/// Connection level failure.
	Transport,
	/// The endpoint is rate limiting us.
	RateLimit,
	/// Malformed request or parameters.
	InvalidArgument,
	/// The nonce was already used on chain.
	NonceExpired,
	/// A replacement was rejected as not paying enough.
	ReplacementUnderpriced,
	/// The transaction is already in the endpoint mempool.
	AlreadyKnown,
	/// The sender cannot pay for the transaction.
	InsufficientFunds,
	/// Execution reverted.
	ExecutionReverted,
	/// Any other endpoint side failure.
	Server,
}
