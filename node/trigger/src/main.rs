use anyhow::{bail, Context, Result};
use clap::Parser;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use veritor_common::contracts::{ControllerClient, VerifierClient};

#[derive(Parser, Debug)]
#[clap(name = "verify")]
#[clap(about = "Submits a manual verify request to the verifier contract")]
struct Args {
    /// Ethereum JSON-RPC endpoint
    #[clap(short, long, default_value = "http://localhost:8545")]
    rpc: String,

    /// Controller contract address
    #[clap(short, long)]
    controller: String,

    /// Key of the account submitting the request
    #[clap(short = 'k', long, env = "PRIVATE_KEY")]
    private_key: String,

    #[clap(long, default_value = "1337")]
    chain_id: u64,

    #[clap(long, default_value = "0")]
    job_id: u64,

    #[clap(long, default_value = "0")]
    claim_id: u64,

    #[clap(long, default_value = "0")]
    segment_number: u64,

    #[clap(long, default_value = "P720p60fps16x9,P720p30fps16x9")]
    transcoding_options: String,

    /// Content address of the input data
    #[clap(long, default_value = "QmR9BnJQisvevpCoSVWWKyownN58nydb2zQt9Z2VtnTnKe")]
    data_storage_hash: String,

    /// Claimed hash of the transcoded output, hex encoded
    #[clap(
        long,
        default_value = "0x6644a3057b9d236bcc3b632068af92d008b2f4baf20ae9b78052ea75f729cedf"
    )]
    transcoded_data_hash: String,
}

fn parse_hash(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim_start_matches("0x")).context("invalid hash encoding")?;
    if bytes.len() != 32 {
        bail!("hash must be 32 bytes, got {}", bytes.len());
    }

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let transcoded_data_hash =
        parse_hash(&args.transcoded_data_hash).context("invalid transcoded data hash")?;

    let provider = Provider::<Http>::try_from(args.rpc.as_str())?;
    let wallet = args
        .private_key
        .parse::<LocalWallet>()?
        .with_chain_id(args.chain_id);
    let client = Arc::new(SignerMiddleware::new(provider, wallet));

    let controller_addr =
        Address::from_str(&args.controller).context("invalid controller address")?;
    let controller = ControllerClient::connect(controller_addr, client.clone()).await?;
    let verifier = VerifierClient::connect(controller.verifier_address().await?, client).await?;

    info!(
        "Submitting verify request for job {} claim {} segment {}",
        args.job_id, args.claim_id, args.segment_number
    );

    let receipt = verifier
        .verify(
            U256::from(args.job_id),
            U256::from(args.claim_id),
            U256::from(args.segment_number),
            args.transcoding_options,
            args.data_storage_hash,
            transcoded_data_hash,
        )
        .await?;

    info!("Verify request mined in tx {:?}", receipt.transaction_hash);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_hash;

    #[test]
    fn parses_prefixed_and_bare_hashes() {
        let bare = "6644a3057b9d236bcc3b632068af92d008b2f4baf20ae9b78052ea75f729cedf";
        let prefixed = format!("0x{}", bare);

        assert_eq!(parse_hash(bare).unwrap(), parse_hash(&prefixed).unwrap());
        assert_eq!(parse_hash(bare).unwrap()[0], 0x66);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_hash("0xabcd").is_err());
    }
}
