//! Main entry point for the relayer CLI.
//!
//! Loads the relayer configuration, builds the endpoints and routers of one
//! chain and runs a single command against them: cross-checked reads of the
//! block number, nonce and balance, a fee estimate, or a full delivery.

use alloy_primitives::{Address, Bytes, U256};
use clap::{Parser, Subcommand};
use relayer_config::Config;
use relayer_delivery::{create_estimator, DeliveryRequest, GasEstimator, NonceFetcher};
use relayer_rpc::EndpointInterface;
use relayer_types::{BlockTag, FeeStructure, MetricsSink, TracingMetrics};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

mod factory_registry;

use factory_registry::{build_chain, build_delivery, build_signer, ChainRelayer};

/// Command-line arguments for the relayer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "RELAYER_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	/// Chain to operate on, optional when only one chain is configured
	#[arg(long, env = "RELAYER_CHAIN_ID")]
	chain_id: Option<u64>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
	/// Prints the block number elected across endpoints
	Block,
	/// Prints the pending nonce of an account, aggregated across endpoints
	Nonce {
		#[arg(long)]
		address: Address,
	},
	/// Prints the balance of an account agreed on by a quorum of endpoints
	Balance {
		#[arg(long)]
		address: Address,
		/// Block number to read at instead of the elected block
		#[arg(long)]
		block: Option<u64>,
	},
	/// Prints the fees a first broadcast would use
	Fees,
	/// Delivers a transaction through every endpoint with the configured signer
	Send {
		#[arg(long)]
		to: Address,
		#[arg(long, default_value = "0x")]
		data: Bytes,
		#[arg(long, default_value = "0")]
		value: U256,
		/// Look up the receipt after delivery and check endpoints agree on it
		#[arg(long)]
		wait: bool,
	},
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Invalid config path: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;
	let chain_id = resolve_chain_id(&config, args.chain_id)?;
	tracing::info!(chain_id = chain_id, config = %config_path, "Loaded configuration");

	let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
	let chain = build_chain(&config, chain_id, metrics.clone())?;
	let output = run(args.command, &config, &chain, metrics).await?;
	println!("{}", serde_json::to_string_pretty(&output)?);
	Ok(())
}

/// Picks the chain to operate on.
fn resolve_chain_id(config: &Config, requested: Option<u64>) -> Result<u64, String> {
	match requested {
		Some(chain_id) if config.chains.contains_key(&chain_id) => Ok(chain_id),
		Some(chain_id) => Err(format!("Chain {} is not configured", chain_id)),
		None => {
			let mut configured: Vec<u64> = config.chains.keys().copied().collect();
			configured.sort_unstable();
			match configured.as_slice() {
				[only] => Ok(*only),
				_ => Err(format!(
					"Several chains are configured ({:?}), pass --chain-id",
					configured
				)),
			}
		},
	}
}

async fn run(
	command: Command,
	config: &Config,
	chain: &ChainRelayer,
	metrics: Arc<dyn MetricsSink>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
	let output = match command {
		Command::Block => {
			let block = match &chain.agreement {
				Some(router) => router.elect_block_number().await?,
				None => chain.reader.get_block_number().await?,
			};
			json!({ "chain_id": chain.chain_id, "block": block })
		},
		Command::Nonce { address } => {
			let fetcher = NonceFetcher::new(chain.endpoints.clone(), &config.nonce)?;
			let nonce = fetcher.fetch(address, BlockTag::Pending).await?;
			json!({ "address": address, "nonce": nonce })
		},
		Command::Balance { address, block } => {
			let tag = block.map(BlockTag::Number);
			let balance = match &chain.agreement {
				Some(router) => router.get_balance_with_agreement(address, tag).await?,
				None => {
					chain
						.reader
						.get_balance(address, tag.unwrap_or_default())
						.await?
				},
			};
			json!({ "address": address, "balance": balance.to_string() })
		},
		Command::Fees => {
			let options = config.delivery_for(chain.chain_id)?;
			let estimator = create_estimator(&options);
			let fees = estimator.estimate_initial(chain.reader.as_ref()).await?;
			fees_json(&fees)
		},
		Command::Send {
			to,
			data,
			value,
			wait,
		} => {
			let signer = build_signer(config)?;
			let delivery = build_delivery(config, chain, signer, metrics)?;
			let receipt = delivery
				.deliver(DeliveryRequest::new(to, data).with_value(value))
				.await?;
			let mut output = json!({
				"endpoint": receipt.endpoint,
				"nonce": receipt.nonce,
				"attempts": receipt.attempts,
				"hashes": receipt.hashes,
			});
			if wait {
				let mined = delivery.wait_for_receipts(&receipt.hashes).await?;
				output["transaction_hash"] = json!(mined.transaction_hash);
				output["block_number"] = json!(mined.block_number);
				output["status"] = json!(mined.status);
			}
			output
		},
	};
	Ok(output)
}

fn fees_json(fees: &FeeStructure) -> serde_json::Value {
	match fees {
		FeeStructure::Eip1559(fee) => json!({
			"type": "eip1559",
			"max_fee_per_gas": fee.max_fee_per_gas.to_string(),
			"max_priority_fee_per_gas": fee.max_priority_fee_per_gas.to_string(),
		}),
		FeeStructure::Auction(fee) => json!({
			"type": "auction",
			"gas_price": fee.gas_price.to_string(),
		}),
	}
}
