//! Fee structures and per-attempt delivery parameters.
//!
//! A delivery never mixes fee models: every attempt of one transaction uses
//! either the EIP-1559 pair or a single auction gas price.

use serde::{Deserialize, Serialize};
use std::fmt;

/// EIP-1559 fee pair in wei per gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Eip1559Fee {
	pub max_fee_per_gas: u128,
	pub max_priority_fee_per_gas: u128,
}

/// Auction model gas price in wei per gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AuctionFee {
	pub gas_price: u128,
}

/// Fee structure of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeStructure {
	Eip1559(Eip1559Fee),
	Auction(AuctionFee),
}

impl FeeStructure {
	/// Creates an EIP-1559 fee structure.
	pub fn eip1559(max_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
		Self::Eip1559(Eip1559Fee {
			max_fee_per_gas,
			max_priority_fee_per_gas,
		})
	}

	/// Creates an auction fee structure.
	pub fn auction(gas_price: u128) -> Self {
		Self::Auction(AuctionFee { gas_price })
	}

	/// Returns true when both structures use the same fee model.
	pub fn same_model(&self, other: &FeeStructure) -> bool {
		matches!(
			(self, other),
			(Self::Eip1559(_), Self::Eip1559(_)) | (Self::Auction(_), Self::Auction(_))
		)
	}

	/// Highest price per gas this fee structure can pay.
	pub fn max_price_per_gas(&self) -> u128 {
		match self {
			Self::Eip1559(fee) => fee.max_fee_per_gas,
			Self::Auction(fee) => fee.gas_price,
		}
	}

	/// Returns true if every component is at least the matching component of `previous`.
	///
	/// Structures of different fee models never dominate each other.
	pub fn dominates(&self, previous: &FeeStructure) -> bool {
		match (self, previous) {
			(Self::Eip1559(next), Self::Eip1559(prev)) => {
				next.max_fee_per_gas >= prev.max_fee_per_gas
					&& next.max_priority_fee_per_gas >= prev.max_priority_fee_per_gas
			},
			(Self::Auction(next), Self::Auction(prev)) => next.gas_price >= prev.gas_price,
			_ => false,
		}
	}

	/// Componentwise maximum of two structures of the same model.
	///
	/// When the models differ `self` is returned unchanged.
	pub fn at_least(self, floor: &FeeStructure) -> FeeStructure {
		match (self, floor) {
			(Self::Eip1559(next), Self::Eip1559(prev)) => Self::eip1559(
				next.max_fee_per_gas.max(prev.max_fee_per_gas),
				next.max_priority_fee_per_gas
					.max(prev.max_priority_fee_per_gas),
			),
			(Self::Auction(next), Self::Auction(prev)) => {
				Self::auction(next.gas_price.max(prev.gas_price))
			},
			(next, _) => next,
		}
	}
}

impl fmt::Display for FeeStructure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Eip1559(fee) => write!(
				f,
				"maxFeePerGas={} maxPriorityFeePerGas={}",
				fee.max_fee_per_gas, fee.max_priority_fee_per_gas
			),
			Self::Auction(fee) => write!(f, "gasPrice={}", fee.gas_price),
		}
	}
}

/// Parameters of one broadcast attempt.
///
/// Attempts are immutable; a rescale derives the next attempt with
/// [`DeliveryAttempt::rescaled`] so the previous fees stay available as the
/// floor for the next ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
	pub nonce: u64,
	pub gas_limit: u64,
	pub fee: FeeStructure,
	pub attempt: u32,
}

impl DeliveryAttempt {
	/// Creates the first attempt for a nonce.
	pub fn first(nonce: u64, gas_limit: u64, fee: FeeStructure) -> Self {
		Self {
			nonce,
			gas_limit,
			fee,
			attempt: 1,
		}
	}

	/// Derives the next attempt with new gas limit and fees.
	///
	/// Fees lower than the current ones are lifted to the current values so the
	/// sequence of attempts never decreases in any fee component.
	pub fn rescaled(&self, gas_limit: u64, fee: FeeStructure) -> Self {
		Self {
			nonce: self.nonce,
			gas_limit,
			fee: fee.at_least(&self.fee),
			attempt: self.attempt + 1,
		}
	}
}
