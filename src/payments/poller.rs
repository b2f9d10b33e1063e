// Client confirmation polling: bounded, cancellable status checks for a
// pending push payment. One outstanding read at a time; transient read
// errors consume the tick instead of killing the chain.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::payments::errors::PaymentError;
use crate::payments::store::PaymentStore;
use crate::payments::types::PaymentStatus;
use crate::settings::PollerSettings;

/// Read seam for poll checks. The store implements it; tests substitute
/// counting doubles.
pub trait StatusSource: Send + Sync {
    fn status_by_reference(&self, reference: &str) -> Result<Option<PaymentStatus>, PaymentError>;
}

impl StatusSource for PaymentStore {
    fn status_by_reference(&self, reference: &str) -> Result<Option<PaymentStatus>, PaymentError> {
        Ok(self
            .get_payment_by_reference(reference)?
            .map(|record| record.status))
    }
}

/// Terminal outcome of one poll chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed,
    /// Attempt bound exhausted without a terminal status. Says nothing about
    /// whether the payment ultimately succeeded.
    TimedOut,
    Cancelled,
}

#[derive(Clone)]
pub struct StatusPoller {
    source: Arc<dyn StatusSource>,
    cfg: PollerSettings,
}

impl StatusPoller {
    pub fn new(source: Arc<dyn StatusSource>, cfg: PollerSettings) -> Self {
        Self { source, cfg }
    }

    /// Poll until the record turns terminal, the token is cancelled, or the
    /// attempt bound is exhausted.
    pub async fn poll(&self, reference: &str, cancel: CancellationToken) -> PollOutcome {
        // Grace period before the first check gives the provider time to
        // start processing.
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(self.cfg.grace_period) => {}
        }

        for attempt in 1..=self.cfg.max_attempts {
            match self.source.status_by_reference(reference) {
                Ok(Some(PaymentStatus::Completed)) => {
                    debug!(provider_reference = %reference, attempt, "payment confirmed");
                    return PollOutcome::Completed;
                }
                Ok(Some(PaymentStatus::Failed)) => {
                    debug!(provider_reference = %reference, attempt, "payment failed");
                    return PollOutcome::Failed;
                }
                // A record not yet visible counts the same as pending.
                Ok(Some(PaymentStatus::Pending)) | Ok(None) => {
                    debug!(provider_reference = %reference, attempt, "payment still pending");
                }
                Err(e) => {
                    warn!(
                        provider_reference = %reference,
                        attempt,
                        error = %e,
                        "status check failed, retrying on next tick"
                    );
                }
            }

            if attempt == self.cfg.max_attempts {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
            }
        }

        PollOutcome::TimedOut
    }
}
