use crate::extract;
use crate::runner::ExecutionRunner;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use veritor_common::contracts::VerifierClient;
use veritor_common::types::VerificationRequest;

/// Issues request numbers to in-flight executions. A single atomic
/// fetch-add, so concurrently delivered events always get distinct
/// numbers and never share a log file.
pub struct RequestSequence(AtomicU64);

impl RequestSequence {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Wires execution, result extraction, and the on-chain callback for
/// each delivered verify request.
pub struct Pipeline {
    runner: ExecutionRunner,
    verifier: VerifierClient,
    sequence: RequestSequence,
}

impl Pipeline {
    pub fn new(runner: ExecutionRunner, verifier: VerifierClient) -> Self {
        Self {
            runner,
            verifier,
            sequence: RequestSequence::new(),
        }
    }

    /// Starts a fixed pool of workers draining the event queue. Workers
    /// exit once the queue is closed and drained, so unsubscribing the
    /// watcher lets in-flight requests finish before shutdown.
    pub fn spawn_workers(
        self: Arc<Self>,
        events: mpsc::Receiver<VerificationRequest>,
        count: usize,
    ) -> Vec<JoinHandle<()>> {
        let events = Arc::new(Mutex::new(events));

        (0..count.max(1))
            .map(|_| {
                let pipeline = self.clone();
                let events = events.clone();

                tokio::spawn(async move {
                    loop {
                        let request = { events.lock().await.recv().await };
                        let Some(request) = request else { break };

                        let number = pipeline.sequence.next();
                        info!(
                            "Processing verify request {} as execution {}",
                            request.request_id, number
                        );

                        if let Err(e) = pipeline.process(number, &request).await {
                            error!(
                                "Verify request {} (execution {}) failed: {:#}",
                                request.request_id, number, e
                            );
                        }
                    }
                })
            })
            .collect()
    }

    /// A failure at any stage is contained to this request; nothing
    /// malformed ever reaches the chain.
    async fn process(&self, number: u64, request: &VerificationRequest) -> Result<()> {
        let record = self
            .runner
            .run(
                number,
                &request.data_storage_hash,
                &request.transcoding_options,
            )
            .await
            .context("execution failed")?;

        let result = extract::extract_result(&record)
            .await
            .context("result extraction failed")?;

        let receipt = self
            .verifier
            .invoke_callback(request.request_id, result.bytes())
            .await
            .context("callback submission failed")?;

        info!(
            "Request {} answered with 0x{} in block {:?}",
            request.request_id,
            result.as_str(),
            receipt.block_number
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn concurrent_assignments_yield_distinct_numbers() {
        let sequence = Arc::new(RequestSequence::new());

        let mut handles = Vec::new();
        for _ in 0..64 {
            let sequence = sequence.clone();
            handles.push(tokio::spawn(async move { sequence.next() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 64);
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use ethers::middleware::SignerMiddleware;
        use ethers::providers::{Http, Provider};
        use ethers::signers::LocalWallet;
        use ethers::types::{Address, U256};
        use std::path::Path;

        const SAMPLE: &str = "6644a3057b9d236bcc3b632068af92d008b2f4baf20ae9b78052ea75f729cedf";

        fn stub_runtime(dir: &Path, body: &str) -> String {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.join("fake-runtime");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        /// Client wired to a closed port: constructing it is fine, any
        /// actual submission would fail.
        fn offline_verifier() -> VerifierClient {
            let provider = Provider::<Http>::try_from("http://127.0.0.1:1").unwrap();
            let wallet: LocalWallet =
                "0000000000000000000000000000000000000000000000000000000000000001"
                    .parse()
                    .unwrap();
            let client = Arc::new(SignerMiddleware::new(provider, wallet));
            VerifierClient::new(Address::zero(), client)
        }

        fn request() -> VerificationRequest {
            VerificationRequest {
                request_id: U256::from(1),
                job_id: U256::from(2),
                claim_id: U256::from(3),
                segment_number: U256::zero(),
                transcoding_options: "P720p60fps16x9,P720p30fps16x9".to_string(),
                data_storage_hash: "QmXYZ".to_string(),
                data_hash: [0u8; 32],
                transcoded_data_hash: [0u8; 32],
            }
        }

        #[tokio::test]
        async fn execution_log_last_line_becomes_the_result() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = stub_runtime(
                dir.path(),
                &format!("echo \"$@\"\necho fetching input\necho {}", SAMPLE),
            );

            let runner = ExecutionRunner::new(&runtime, "verification", dir.path());
            let record = runner
                .run(0, "QmXYZ", "P720p60fps16x9,P720p30fps16x9")
                .await
                .unwrap();

            let result = extract::extract_result(&record).await.unwrap();
            assert_eq!(result.as_str(), SAMPLE);

            let log = std::fs::read_to_string(&record.log_path).unwrap();
            assert!(log.contains("ARG0=QmXYZ"));
            assert!(log.contains("ARG1=P720p60fps16x9,P720p30fps16x9"));
        }

        #[tokio::test]
        async fn malformed_result_never_reaches_the_chain() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = stub_runtime(dir.path(), "echo bad");

            let runner = ExecutionRunner::new(&runtime, "verification", dir.path());
            let pipeline = Pipeline::new(runner, offline_verifier());

            // The callback stage is unreachable past the failed
            // extraction; an attempt against the offline client would
            // fail with a different error.
            let err = pipeline.process(0, &request()).await.unwrap_err();
            assert!(err.to_string().contains("result extraction failed"));
        }
    }
}
