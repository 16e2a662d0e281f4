//! Dynamic factory registry for relayer implementations.
//!
//! Endpoint and signer implementations are looked up by the name used in
//! the configuration, then wired into routers and delivery per chain.

use relayer_account::{AccountError, SignerFactory, SignerInterface};
use relayer_config::{Config, ConfigError};
use relayer_delivery::{
	DeliveryError, GasOracle, GasOracles, NonceFetcher, StaticGasOracle, TxDeliveryMan,
	TxNonceCoordinator,
};
use relayer_router::{AgreementRouter, RouterError};
use relayer_rpc::{EndpointFactory, EndpointHandle, EndpointInterface, RpcError};
use relayer_types::MetricsSink;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Errors raised while assembling the relayer from its configuration.
#[derive(Debug, Error)]
pub enum BuildError {
	#[error("Unknown {kind} implementation '{name}'. Available: [{available}]")]
	UnknownImplementation {
		kind: &'static str,
		name: String,
		available: String,
	},
	#[error("Config error: {0}")]
	Config(#[from] ConfigError),
	#[error("Endpoint error: {0}")]
	Rpc(#[from] RpcError),
	#[error("Router error: {0}")]
	Router(#[from] RouterError),
	#[error("Signer error: {0}")]
	Account(#[from] AccountError),
	#[error("Delivery error: {0}")]
	Delivery(#[from] DeliveryError),
	#[error("No signer configured")]
	MissingSigner,
}

/// Registry of every implementation factory linked into the binary.
pub struct FactoryRegistry {
	pub endpoint: HashMap<String, EndpointFactory>,
	pub signer: HashMap<String, SignerFactory>,
}

impl Default for FactoryRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl FactoryRegistry {
	/// Create a new empty registry
	pub fn new() -> Self {
		Self {
			endpoint: HashMap::new(),
			signer: HashMap::new(),
		}
	}

	pub fn register_endpoint(&mut self, name: impl Into<String>, factory: EndpointFactory) {
		self.endpoint.insert(name.into(), factory);
	}

	pub fn register_signer(&mut self, name: impl Into<String>, factory: SignerFactory) {
		self.signer.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Returns the global registry, filling it on first use.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in relayer_rpc::get_all_implementations() {
			tracing::debug!("Registering endpoint implementation: {}", name);
			registry.register_endpoint(name, factory);
		}

		for (name, factory) in relayer_account::get_all_implementations() {
			tracing::debug!("Registering signer implementation: {}", name);
			registry.register_signer(name, factory);
		}

		registry
	})
}

fn lookup<F: Copy>(
	factories: &HashMap<String, F>,
	kind: &'static str,
	name: &str,
) -> Result<F, BuildError> {
	factories.get(name).copied().ok_or_else(|| {
		let mut available: Vec<_> = factories.keys().cloned().collect();
		available.sort();
		BuildError::UnknownImplementation {
			kind,
			name: name.to_string(),
			available: available.join(", "),
		}
	})
}

/// Everything needed to read from one chain.
pub struct ChainRelayer {
	pub chain_id: u64,
	pub endpoints: Vec<EndpointHandle>,
	/// Agreement router over every endpoint, when there are at least two.
	pub agreement: Option<Arc<AgreementRouter>>,
	/// Reads go through the agreement router, or the single endpoint.
	pub reader: Arc<dyn EndpointInterface>,
}

/// Builds one handle per configured RPC URL of `chain_id`.
pub fn build_endpoints(config: &Config, chain_id: u64) -> Result<Vec<EndpointHandle>, BuildError> {
	let registry = get_registry();
	let factory = lookup(&registry.endpoint, "endpoint", &config.endpoint.primary)?;
	config
		.chain(chain_id)?
		.rpc_urls
		.iter()
		.map(|url| -> Result<EndpointHandle, BuildError> {
			let endpoint: Arc<dyn EndpointInterface> =
				Arc::from(factory(&config.endpoint.config_for(url))?);
			Ok(EndpointHandle::new(url.clone(), chain_id, endpoint))
		})
		.collect()
}

/// Builds the endpoints and read router of `chain_id`.
pub fn build_chain(
	config: &Config,
	chain_id: u64,
	metrics: Arc<dyn MetricsSink>,
) -> Result<ChainRelayer, BuildError> {
	let endpoints = build_endpoints(config, chain_id)?;

	let (agreement, reader): (Option<Arc<AgreementRouter>>, Arc<dyn EndpointInterface>) =
		if endpoints.len() >= 2 {
			let mut options = config.agreement_for(chain_id)?;
			options.quorum = options.quorum.min(endpoints.len());
			let router = Arc::new(
				AgreementRouter::new(endpoints.clone(), config.fallback.clone(), options)?
					.with_metrics(metrics),
			);
			let reader: Arc<dyn EndpointInterface> = router.clone();
			(Some(router), reader)
		} else {
			tracing::warn!(chain_id = chain_id, "Single endpoint configured, reads are not cross-checked");
			(None, endpoints[0].inner().clone())
		};

	tracing::info!(
		chain_id = chain_id,
		endpoints = endpoints.len(),
		agreement = agreement.is_some(),
		"Built chain"
	);
	Ok(ChainRelayer {
		chain_id,
		endpoints,
		agreement,
		reader,
	})
}

/// Builds the configured signer.
pub fn build_signer(config: &Config) -> Result<Arc<dyn SignerInterface>, BuildError> {
	let signer_config = config.signer.as_ref().ok_or(BuildError::MissingSigner)?;
	let factory = lookup(&get_registry().signer, "signer", &signer_config.primary)?;
	let implementation = signer_config.primary_config().ok_or(BuildError::MissingSigner)?;
	Ok(Arc::from(factory(implementation)?))
}

/// Builds the signer's delivery pipeline for `chain`.
///
/// In fast nonce mode the reconciler is started as well; it stops once the
/// returned delivery is dropped.
pub fn build_delivery(
	config: &Config,
	chain: &ChainRelayer,
	signer: Arc<dyn SignerInterface>,
	metrics: Arc<dyn MetricsSink>,
) -> Result<TxDeliveryMan, BuildError> {
	let fetcher = NonceFetcher::new(chain.endpoints.clone(), &config.nonce)?;
	let coordinator = Arc::new(TxNonceCoordinator::new(
		signer.address(),
		fetcher,
		config.nonce.clone(),
	));
	coordinator.spawn_reconciler();

	let oracles: GasOracles = config
		.gas_oracles
		.iter()
		.map(|(chain_id, fees)| {
			let oracle: Arc<dyn GasOracle> = Arc::new(StaticGasOracle::new(*fees));
			(*chain_id, oracle)
		})
		.collect();

	let delivery = TxDeliveryMan::new(
		chain.endpoints.clone(),
		signer,
		coordinator,
		config.delivery_for(chain.chain_id)?,
	)?
	.with_oracles(oracles)
	.with_metrics(metrics);
	Ok(delivery)
}
