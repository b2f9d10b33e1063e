// Provider callback processing: the sole finalizer for push payments.
// Every delivery is acknowledged, duplicates are no-ops, and only a newly
// completed payment touches the subscription row.

use chrono::{Months, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::payment_counter_inc;
use crate::payments::errors::PaymentError;
use crate::payments::store::{Finalize, PaymentStore};
use crate::payments::types::{
    CallbackAck, PaymentRecord, PaymentStatus, StkCallbackEnvelope, SubscriptionRecord,
};

/// Contact lookup against the identity service, used to stamp the
/// subscription row for receipts and notifications.
pub trait IdentityDirectory: Send + Sync {
    fn email_for(&self, user_id: &str) -> Option<String>;
}

/// Directory used when no identity service is wired in.
pub struct NullDirectory;

impl IdentityDirectory for NullDirectory {
    fn email_for(&self, _user_id: &str) -> Option<String> {
        None
    }
}

pub struct CallbackProcessor {
    store: Arc<PaymentStore>,
    identity: Arc<dyn IdentityDirectory>,
}

impl CallbackProcessor {
    pub fn new(store: Arc<PaymentStore>, identity: Arc<dyn IdentityDirectory>) -> Self {
        Self { store, identity }
    }

    /// Process one provider delivery. Always returns an acknowledgement; the
    /// ack code reflects whether this side could act on the delivery, never
    /// the payment's own outcome.
    #[instrument(skip(self, envelope))]
    pub async fn process(&self, envelope: StkCallbackEnvelope) -> CallbackAck {
        let callback = envelope.body.stk_callback;
        let reference = callback.checkout_request_id.as_str();
        let success = callback.result_code == 0;
        let status = if success {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };
        let receipt = callback
            .callback_metadata
            .as_ref()
            .and_then(|metadata| metadata.receipt());
        let reported_amount = callback
            .callback_metadata
            .as_ref()
            .and_then(|metadata| metadata.amount());
        let subscriber = callback
            .callback_metadata
            .as_ref()
            .and_then(|metadata| metadata.phone_number());

        debug!(
            provider_reference = %reference,
            result_code = callback.result_code,
            "processing provider callback"
        );

        let finalized =
            match self
                .store
                .finalize_by_reference(reference, status, receipt, Utc::now())
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        provider_reference = %reference,
                        error = %e,
                        "failed to finalize payment record"
                    );
                    payment_counter_inc!("payments.callback.error");
                    return CallbackAck::internal_error();
                }
            };

        match finalized {
            None => {
                // Unknown reference. Acknowledge anyway so the provider does
                // not retry a delivery this side cannot resolve.
                warn!(
                    provider_reference = %reference,
                    "callback for unknown provider reference"
                );
                payment_counter_inc!("payments.callback.unknown_reference");
                CallbackAck::processed()
            }
            Some(Finalize::AlreadyFinal(record)) => {
                debug!(
                    provider_reference = %reference,
                    status = record.status.as_str(),
                    "duplicate callback for terminal record"
                );
                payment_counter_inc!("payments.callback.duplicate");
                CallbackAck::processed()
            }
            Some(Finalize::Applied(record)) => {
                if success {
                    if let Err(e) = self.extend_subscription(&record) {
                        // The payment itself is final; the missing
                        // subscription write is recovered from alerts.
                        error!(
                            user_id = %record.user_id,
                            provider_reference = %reference,
                            error = %e,
                            "failed to upsert subscription after completed payment"
                        );
                        payment_counter_inc!("payments.callback.subscription_error");
                        return CallbackAck::internal_error();
                    }
                    if let Some(reported) = reported_amount {
                        if reported != record.amount_minor_units {
                            warn!(
                                provider_reference = %reference,
                                initiated = record.amount_minor_units,
                                reported = reported,
                                "provider-reported amount differs from initiated amount"
                            );
                        }
                    }
                    info!(
                        provider_reference = %reference,
                        user_id = %record.user_id,
                        amount = record.amount_minor_units,
                        currency = %record.currency,
                        subscriber = ?subscriber,
                        "payment completed"
                    );
                    payment_counter_inc!("payments.completed", "method" => record.method.as_str());
                } else {
                    info!(
                        provider_reference = %reference,
                        result_desc = %callback.result_desc,
                        "payment failed"
                    );
                    payment_counter_inc!("payments.failed", "method" => record.method.as_str());
                }
                CallbackAck::processed()
            }
        }
    }

    /// Subscription window resets forward one calendar month from the moment
    /// of confirmation; prior remaining time does not stack.
    fn extend_subscription(&self, record: &PaymentRecord) -> Result<(), PaymentError> {
        let now = Utc::now();
        let period_end = now
            .checked_add_months(Months::new(1))
            .unwrap_or(now + chrono::Duration::days(30));

        let sub = SubscriptionRecord {
            user_id: record.user_id.clone(),
            email: self.identity.email_for(&record.user_id),
            tier: record.subscription_tier.clone(),
            active: true,
            period_end,
        };
        self.store.upsert_subscription(&sub)
    }
}
