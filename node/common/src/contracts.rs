use ethers::{
    contract::abigen,
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::LocalWallet,
    types::{Address, TransactionReceipt, U256},
    utils::keccak256,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

// Generate contract bindings
abigen!(
    Controller,
    r#"[
        function getContract(bytes32 id) external view returns (address)
    ]"#
);

abigen!(
    Verifier,
    r#"[
        function verify(uint256 jobId, uint256 claimId, uint256 segmentNumber, string transcodingOptions, string dataStorageHash, bytes32 transcodedDataHash) external
        function __callback(uint256 requestId, bytes32 result) external
        function verificationCodeHash() external view returns (string)
        event VerifyRequest(uint256 indexed requestId, uint256 indexed jobId, uint256 indexed claimId, uint256 segmentNumber, string transcodingOptions, string dataStorageHash, bytes32 dataHash, bytes32 transcodedDataHash)
    ]"#
);

pub type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Gas for the callback transaction. Fixed rather than estimated: the
/// callback triggers an additional internal contract call that gas
/// estimation undercounts.
const CALLBACK_GAS: u64 = 3_000_000;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("no contract code at {0:?}")]
    NoCode(Address),
    #[error("contract call failed: {0}")]
    Call(String),
    #[error("transaction dropped before mining")]
    Dropped,
    #[error(transparent)]
    Provider(#[from] ethers::providers::ProviderError),
}

/// Registry contract that resolves protocol contract addresses by name.
#[derive(Clone)]
pub struct ControllerClient {
    contract: Controller<Client>,
}

impl ControllerClient {
    pub fn new(address: Address, client: Arc<Client>) -> Self {
        let contract = Controller::new(address, client);
        Self { contract }
    }

    /// Binds the controller at `address` after verifying contract code
    /// exists there. The handle is stored once and never re-derived.
    pub async fn connect(address: Address, client: Arc<Client>) -> Result<Self, TransactionError> {
        ensure_contract_code(&client, address).await?;
        Ok(Self::new(address, client))
    }

    pub async fn verifier_address(&self) -> Result<Address, TransactionError> {
        let id = keccak256("Verifier");
        self.contract
            .get_contract(id)
            .call()
            .await
            .map_err(|e| TransactionError::Call(e.to_string()))
    }
}

/// Verifier contract client: manual verify submission, the result
/// callback, and the verify-request event filter.
#[derive(Clone)]
pub struct VerifierClient {
    contract: Verifier<Client>,
}

impl VerifierClient {
    pub fn new(address: Address, client: Arc<Client>) -> Self {
        let contract = Verifier::new(address, client);
        Self { contract }
    }

    pub async fn connect(address: Address, client: Arc<Client>) -> Result<Self, TransactionError> {
        ensure_contract_code(&client, address).await?;
        Ok(Self::new(address, client))
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }

    /// Content hash of the verification code archive published on-chain.
    pub async fn verification_code_hash(&self) -> Result<String, TransactionError> {
        self.contract
            .verification_code_hash()
            .call()
            .await
            .map_err(|e| TransactionError::Call(e.to_string()))
    }

    /// Event builder for verify requests; the watcher turns this into a
    /// polled stream.
    pub fn verify_requests(
        &self,
    ) -> ethers::contract::builders::Event<Arc<Client>, Client, VerifyRequestFilter> {
        self.contract.verify_request_filter()
    }

    /// Submits a manual verify request with an explicit gas estimate.
    pub async fn verify(
        &self,
        job_id: U256,
        claim_id: U256,
        segment_number: U256,
        transcoding_options: String,
        data_storage_hash: String,
        transcoded_data_hash: [u8; 32],
    ) -> Result<TransactionReceipt, TransactionError> {
        let call = self.contract.verify(
            job_id,
            claim_id,
            segment_number,
            transcoding_options,
            data_storage_hash,
            transcoded_data_hash,
        );
        let gas = call
            .estimate_gas()
            .await
            .map_err(|e| TransactionError::Call(e.to_string()))?;

        let call = call.gas(gas);
        let pending = call
            .send()
            .await
            .map_err(|e| TransactionError::Call(e.to_string()))?;

        pending.await?.ok_or(TransactionError::Dropped)
    }

    /// Reports a computed result for `request_id` and waits for the
    /// transaction to mine.
    pub async fn invoke_callback(
        &self,
        request_id: U256,
        result: [u8; 32],
    ) -> Result<TransactionReceipt, TransactionError> {
        info!("Invoking callback with 0x{}", hex::encode(result));

        let call = self
            .contract
            .method::<_, ()>("__callback", (request_id, result))
            .map_err(|e| TransactionError::Call(e.to_string()))?
            .gas(CALLBACK_GAS);

        let pending = call
            .send()
            .await
            .map_err(|e| TransactionError::Call(e.to_string()))?;

        pending.await?.ok_or(TransactionError::Dropped)
    }
}

async fn ensure_contract_code(client: &Arc<Client>, address: Address) -> Result<(), TransactionError> {
    let code = client
        .get_code(address, None)
        .await
        .map_err(|e| TransactionError::Call(e.to_string()))?;

    if code.as_ref().is_empty() {
        return Err(TransactionError::NoCode(address));
    }

    Ok(())
}
