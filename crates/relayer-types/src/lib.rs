//! Common types module for the relayer system.
//!
//! This module defines the data types shared by the endpoint, routing and
//! delivery crates: block tags and call requests, fee structures, chain
//! configuration, tunable options and the metrics sink interface.

/// Chain configuration types keyed by chain id.
pub mod chain;
/// Fee structures and per-attempt delivery parameters.
pub mod fees;
/// Metrics sink interface for routed reads and broadcasts.
pub mod metrics;
/// Tunable options for routers, nonce handling and delivery.
pub mod options;
/// Registry trait for config-named implementations.
pub mod registry;
/// Chain-read request and response types.
pub mod rpc;
/// Secret string wrapper for private keys.
pub mod secret_string;
/// Utility functions for election and fee arithmetic.
pub mod utils;
/// Configuration validation types for implementation tables.
pub mod validation;

pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use chain::{deserialize_chains, ChainConfig, ChainsConfig, FeeMarket};
pub use fees::{AuctionFee, DeliveryAttempt, Eip1559Fee, FeeStructure};
pub use metrics::{MetricPoint, MetricsSink, NoopMetrics, TracingMetrics};
pub use options::*;
pub use registry::ImplementationRegistry;
pub use rpc::*;
pub use secret_string::SecretString;
pub use utils::rounded_median;
pub use validation::*;
