//! The `ubb-indexer` binary: index the billboard state from a Bitcoin node.
//!
//! Example run:
//!
//! ubb-indexer --network regtest --rpc-url http://127.0.0.1:18443 \
//!     --rpc-user user --rpc-pass pass \
//!     --genesis-from-height-0

use anyhow::{bail, Context, Result};
use bitcoin::BlockHash;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use ubb_indexer::rpc::BitcoinRpc;
use ubb_indexer::{GenesisRef, Indexer, IndexerConfig, Network, MAINNET_GENESIS};

#[derive(Parser, Debug)]
#[command(name = "ubb-indexer", version, about = "Index the UBB billboard state from a Bitcoin node")]
struct Args {
    /// Hash of the chain tip to index up to. Defaults to the node's best
    /// block.
    tip_hash: Option<String>,

    /// Hash of the block at which the billboard protocol begins. Falls back
    /// to --genesis-from-height-0, then to the compiled-in mainnet genesis.
    genesis_hash: Option<String>,

    /// Directory holding the raw-block cache and the per-genesis state.
    #[arg(long, default_value = "./ubb-data")]
    data_dir: PathBuf,

    /// The bitcoin network.
    #[arg(long, default_value = "mainnet")]
    network: Network,

    /// JSON-RPC endpoint of the bitcoin node.
    #[arg(long, default_value = "http://127.0.0.1:8332")]
    rpc_url: String,

    /// RPC basic-auth user name.
    #[arg(long)]
    rpc_user: Option<String>,

    /// RPC basic-auth password.
    #[arg(long, requires = "rpc_user")]
    rpc_pass: Option<String>,

    /// Additional attempts after a failed RPC call.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Base delay between RPC retries, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    retry_delay: u64,

    /// Resolve the genesis hash with getblockhash(0) instead of passing it.
    #[arg(long)]
    genesis_from_height_0: bool,

    /// Only log warnings and errors.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // The engine is a strictly sequential state machine; a current-thread
    // runtime is all it needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime construction cannot fail");

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let tip = args
        .tip_hash
        .as_deref()
        .map(parse_hash)
        .transpose()
        .context("invalid tip hash")?;

    let genesis = match (&args.genesis_hash, args.genesis_from_height_0) {
        (Some(hash), _) => GenesisRef::Hash(parse_hash(hash).context("invalid genesis hash")?),
        (None, true) => GenesisRef::Height0,
        (None, false) if args.network == Network::Mainnet => GenesisRef::Hash(*MAINNET_GENESIS),
        (None, false) => bail!(
            "a genesis hash is required on {}; pass GENESIS_HASH or --genesis-from-height-0",
            args.network
        ),
    };

    let source = match (&args.rpc_user, &args.rpc_pass) {
        (Some(user), Some(pass)) => BitcoinRpc::new_with_auth(&args.rpc_url, user, pass),
        _ => BitcoinRpc::new(&args.rpc_url),
    };

    let indexer = Indexer::new(
        source,
        IndexerConfig {
            data_dir: args.data_dir,
            network: args.network,
            max_retries: args.max_retries,
            retry_delay: Duration::from_millis(args.retry_delay),
        },
    );

    let cancel = indexer.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing the current block");
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let summary = indexer.run(tip, genesis).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).expect("summary always serializes")
    );
    Ok(())
}

fn parse_hash(s: &str) -> Result<BlockHash> {
    Ok(s.parse::<BlockHash>()?)
}
