use crate::contracts::VerifyRequestFilter;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One observed verify request. Immutable once read from the event and
/// never persisted beyond process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub request_id: U256,
    pub job_id: U256,
    pub claim_id: U256,
    pub segment_number: U256,
    pub transcoding_options: String,
    pub data_storage_hash: String,
    pub data_hash: [u8; 32],
    pub transcoded_data_hash: [u8; 32],
}

impl From<VerifyRequestFilter> for VerificationRequest {
    fn from(event: VerifyRequestFilter) -> Self {
        Self {
            request_id: event.request_id,
            job_id: event.job_id,
            claim_id: event.claim_id,
            segment_number: event.segment_number,
            transcoding_options: event.transcoding_options,
            data_storage_hash: event.data_storage_hash,
            data_hash: event.data_hash,
            transcoded_data_hash: event.transcoded_data_hash,
        }
    }
}

/// Log location of one execution, keyed by the locally assigned request
/// number. Finalized once the process's output stream has fully drained.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub request_number: u64,
    pub log_path: PathBuf,
}
