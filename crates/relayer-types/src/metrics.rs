//! Metrics sink interface.
//!
//! Routers and the delivery engine report one point per routed read and per
//! broadcast. Reporting is fire-and-forget and never influences control flow.

use std::time::Duration;

/// A single observation of an endpoint operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
	/// Operation name, for example `getBlockNumber` or `sendRawTransaction`.
	pub operation: String,
	/// Label of the endpoint that served the operation.
	pub endpoint: String,
	pub chain_id: u64,
	pub success: bool,
	pub latency: Duration,
}

/// Receiver of metric points.
pub trait MetricsSink: Send + Sync {
	/// Records a point. Implementations must not block.
	fn report(&self, point: MetricPoint);
}

/// Sink that drops every point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
	fn report(&self, _point: MetricPoint) {}
}

/// Sink that emits every point as a `tracing` event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
	fn report(&self, point: MetricPoint) {
		tracing::debug!(
			target: "relayer::metrics",
			operation = %point.operation,
			endpoint = %point.endpoint,
			chain_id = point.chain_id,
			success = point.success,
			latency_ms = point.latency.as_millis() as u64,
			"rpc metric"
		);
	}
}
