use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use mediopt_core::PipelineOutcome;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One-shot latch in front of the caller.
///
/// The first `deliver` wins: it cancels the teardown token (every stage watches
/// it) and hands the outcome to the waiting caller. Later calls are no-ops.
#[derive(Debug)]
pub struct ResponseGate {
    delivered: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<PipelineOutcome>>>,
    outcome: Mutex<Option<PipelineOutcome>>,
    teardown: CancellationToken,
}

impl ResponseGate {
    pub fn new(teardown: CancellationToken) -> (Self, oneshot::Receiver<PipelineOutcome>) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            delivered: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            outcome: Mutex::new(None),
            teardown,
        };
        (gate, rx)
    }

    /// Returns `true` only for the call that actually delivered.
    pub fn deliver(&self, outcome: PipelineOutcome) -> bool {
        if self
            .delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(
                status = outcome.http_status(),
                "Outcome already delivered, dropping"
            );
            return false;
        }

        self.teardown.cancel();

        *self.outcome.lock().unwrap_or_else(|p| p.into_inner()) = Some(outcome.clone());

        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = sender {
            if let Err(outcome) = tx.send(outcome) {
                tracing::info!(
                    status = outcome.http_status(),
                    "Caller went away before the outcome was ready"
                );
            }
        }
        true
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// The outcome that won, once there is one.
    pub fn delivered_outcome(&self) -> Option<PipelineOutcome> {
        self.outcome.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }
}
