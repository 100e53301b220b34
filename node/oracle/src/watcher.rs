use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use veritor_common::contracts::{TransactionError, VerifierClient};
use veritor_common::types::VerificationRequest;

/// Watches the verifier contract for verify requests and forwards them,
/// in chain delivery order, into a bounded queue. No deduplication: if
/// the upstream delivers a duplicate event it is passed through.
pub struct EventWatcher {
    verifier: VerifierClient,
}

/// Handle to a live event subscription.
pub struct Subscription {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EventWatcher {
    pub fn new(verifier: VerifierClient) -> Self {
        Self { verifier }
    }

    /// Installs the event filter and starts the poll task. The queue is
    /// bounded: when it fills up, the poll task holds back instead of
    /// buffering an unbounded backlog of executions.
    pub async fn subscribe(
        &self,
        depth: usize,
    ) -> Result<(Subscription, mpsc::Receiver<VerificationRequest>), TransactionError> {
        let (event_tx, event_rx) = mpsc::channel(depth);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let verifier = self.verifier.clone();

        let task = tokio::spawn(async move {
            let events = verifier.verify_requests();
            let mut stream = match events.stream().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TransactionError::Call(e.to_string())));
                    return;
                }
            };

            loop {
                // Poll the stop signal first so a completed receiver is
                // consumed by its own arm and never polled again.
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            let request = VerificationRequest::from(event);
                            info!("Received verify request {}", request.request_id);
                            if event_tx.send(request).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => error!("Failed to decode verify request event: {}", e),
                        None => {
                            warn!("Verify request event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                let subscription = Subscription {
                    stop: Some(stop_tx),
                    task: Some(task),
                };
                Ok((subscription, event_rx))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransactionError::Call(
                "event poll task exited before the filter was installed".to_string(),
            )),
        }
    }
}

impl Subscription {
    /// Stops delivering new events; requests already queued keep
    /// draining. Safe to call before any event has arrived, and
    /// idempotent: second and later calls are no-ops.
    pub async fn stop_watching(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
