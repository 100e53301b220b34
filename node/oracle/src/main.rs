mod archive;
mod extract;
mod pipeline;
mod runner;
mod store;
mod watcher;

use anyhow::{Context, Result};
use archive::ArchiveManager;
use clap::Parser;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
    types::Address,
};
use pipeline::Pipeline;
use runner::ExecutionRunner;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use store::ArchiveStore;
use tracing::{error, info};
use veritor_common::contracts::{ControllerClient, VerifierClient};
use watcher::EventWatcher;

const IMAGE_NAME: &str = "verification";
const LOGS_DIR: &str = "logs";
const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Parser, Debug)]
#[clap(name = "oracle")]
#[clap(about = "Watches the verifier contract and answers verify requests off-chain")]
struct Args {
    /// Ethereum JSON-RPC endpoint
    #[clap(short, long, default_value = "http://localhost:8545")]
    rpc: String,

    /// Controller contract address
    #[clap(short, long)]
    controller: String,

    /// Key of the account answering verify requests
    #[clap(short = 'k', long, env = "PRIVATE_KEY")]
    private_key: String,

    #[clap(long, default_value = "1337")]
    chain_id: u64,

    /// HTTP API of the storage node serving the verification code archive
    #[clap(long, env = "IPFS_API", default_value = "http://127.0.0.1:5001")]
    ipfs_api: String,

    /// Directory holding the archive, its unpack tree, and request logs
    #[clap(long, default_value = ".")]
    workdir: PathBuf,

    /// Container runtime binary
    #[clap(long, default_value = "docker")]
    runtime: String,

    /// Width of the execution worker pool
    #[clap(long, default_value = "1")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting Veritor Oracle");

    let provider = Provider::<Http>::try_from(args.rpc.as_str())?;
    let wallet = args
        .private_key
        .parse::<LocalWallet>()?
        .with_chain_id(args.chain_id);
    let client = Arc::new(SignerMiddleware::new(provider, wallet));

    let controller_addr =
        Address::from_str(&args.controller).context("invalid controller address")?;
    let controller = ControllerClient::connect(controller_addr, client.clone()).await?;
    let verifier_addr = controller.verifier_address().await?;
    info!("Verifier contract at {:?}", verifier_addr);
    let verifier = VerifierClient::connect(verifier_addr, client).await?;

    let code_hash = verifier.verification_code_hash().await?;
    info!("Verification code hash: {}", code_hash);

    let logs_dir = args.workdir.join(LOGS_DIR);
    tokio::fs::create_dir_all(&logs_dir)
        .await
        .context("failed to create log directory")?;

    // No request can be served without a Ready archive, so a setup
    // failure aborts the process.
    let store = ArchiveStore::new(&args.ipfs_api)?;
    let mut archive = ArchiveManager::new(store, &args.workdir, IMAGE_NAME, &args.runtime);
    archive
        .setup(&code_hash)
        .await
        .context("archive setup failed")?;

    let runner = ExecutionRunner::new(&args.runtime, archive.image(), &logs_dir);
    let pipeline = Arc::new(Pipeline::new(runner, verifier.clone()));

    let watcher = EventWatcher::new(verifier);
    let (mut subscription, events) = watcher.subscribe(EVENT_QUEUE_DEPTH).await?;
    info!("Watching for events...");

    let workers = pipeline.spawn_workers(events, args.workers);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Stop watching for events and exiting...");

    subscription.stop_watching().await;

    // In-flight requests drain before teardown.
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task failed: {}", e);
        }
    }

    if let Err(e) = archive.cleanup().await {
        error!("Archive cleanup failed: {}", e);
    }

    Ok(())
}
