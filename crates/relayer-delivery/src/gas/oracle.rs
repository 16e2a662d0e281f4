//! Chain specific fee sources that take precedence over estimation.

use crate::{DeliveryContext, DeliveryError};
use async_trait::async_trait;
use relayer_types::FeeStructure;
use std::collections::HashMap;
use std::sync::Arc;

/// External fee source for one chain.
///
/// When an oracle is registered for the delivery chain its fees are used
/// as they are; estimation only runs if the oracle fails or times out.
#[async_trait]
pub trait GasOracle: Send + Sync {
	async fn get_fees(
		&self,
		context: &DeliveryContext,
		attempt: u32,
	) -> Result<FeeStructure, DeliveryError>;
}

/// Gas oracles keyed by chain id.
pub type GasOracles = HashMap<u64, Arc<dyn GasOracle>>;

/// Oracle answering every attempt with the same fees.
#[derive(Debug, Clone, Copy)]
pub struct StaticGasOracle {
	fees: FeeStructure,
}

impl StaticGasOracle {
	pub fn new(fees: FeeStructure) -> Self {
		Self { fees }
	}
}

#[async_trait]
impl GasOracle for StaticGasOracle {
	async fn get_fees(
		&self,
		_context: &DeliveryContext,
		_attempt: u32,
	) -> Result<FeeStructure, DeliveryError> {
		Ok(self.fees)
	}
}
