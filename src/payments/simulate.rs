// Simulated push gateway for demo deployments
// Resolves pushes through the same asynchronous path as production: the push
// returns a checkout id immediately and a synthetic provider callback lands
// a moment later, so the callback processor stays the only finalizer.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::payments::callback::CallbackProcessor;
use crate::payments::errors::GatewayApiError;
use crate::payments::types::{
    CallbackMetadata, MetadataItem, StkCallback, StkCallbackBody, StkCallbackEnvelope,
};
use crate::payments::{PushGateway, PushRequest};

pub struct SimulatedGateway {
    provider: &'static str,
    success_rate: f64,
    callback_delay: Duration,
    callbacks: Arc<CallbackProcessor>,
}

impl SimulatedGateway {
    pub fn new(
        provider: &'static str,
        success_rate: f64,
        callback_delay: Duration,
        callbacks: Arc<CallbackProcessor>,
    ) -> Self {
        Self {
            provider,
            success_rate: success_rate.clamp(0.0, 1.0),
            callback_delay,
            callbacks,
        }
    }
}

#[async_trait::async_trait]
impl PushGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        self.provider
    }

    async fn initiate_push(&self, request: &PushRequest) -> Result<String, GatewayApiError> {
        let checkout_request_id = format!("ws_CO_{}", Uuid::new_v4().simple());
        let succeed = SmallRng::from_entropy().gen_bool(self.success_rate);

        let callbacks = Arc::clone(&self.callbacks);
        let reference = checkout_request_id.clone();
        let amount = request.amount_minor_units;
        let phone_number = request.phone_number.clone();
        let delay = self.callback_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let envelope = synthetic_callback(&reference, succeed, amount, &phone_number);
            let ack = callbacks.process(envelope).await;
            debug!(
                provider_reference = %reference,
                result_code = ack.result_code,
                "delivered simulated provider callback"
            );
        });

        Ok(checkout_request_id)
    }
}

fn synthetic_callback(
    reference: &str,
    succeed: bool,
    amount: i64,
    phone_number: &str,
) -> StkCallbackEnvelope {
    let stk_callback = if succeed {
        let receipt = Uuid::new_v4().simple().to_string()[..10].to_uppercase();
        StkCallback {
            merchant_request_id: Uuid::new_v4().simple().to_string(),
            checkout_request_id: reference.to_string(),
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            callback_metadata: Some(CallbackMetadata {
                item: vec![
                    MetadataItem {
                        name: "Amount".to_string(),
                        value: Some(serde_json::json!(amount)),
                    },
                    MetadataItem {
                        name: "MpesaReceiptNumber".to_string(),
                        value: Some(serde_json::json!(receipt)),
                    },
                    MetadataItem {
                        name: "PhoneNumber".to_string(),
                        value: Some(serde_json::json!(phone_number)),
                    },
                ],
            }),
        }
    } else {
        StkCallback {
            merchant_request_id: Uuid::new_v4().simple().to_string(),
            checkout_request_id: reference.to_string(),
            result_code: 1032,
            result_desc: "Request cancelled by user".to_string(),
            callback_metadata: None,
        }
    };

    StkCallbackEnvelope {
        body: StkCallbackBody { stk_callback },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::callback::NullDirectory;
    use crate::payments::checkout::CheckoutClient;
    use crate::payments::initiator::PaymentInitiator;
    use crate::payments::poller::{StatusPoller, StatusSource};
    use crate::payments::store::test_support::temp_store;
    use crate::payments::types::{InitiateRequest, PaymentMethod, PaymentStatus};
    use crate::settings::{CheckoutSettings, PollerSettings};
    use chrono::Utc;

    fn harness(success_rate: f64) -> (Arc<crate::payments::store::PaymentStore>, PaymentInitiator) {
        let store = Arc::new(temp_store());
        let callbacks = Arc::new(CallbackProcessor::new(
            Arc::clone(&store),
            Arc::new(NullDirectory),
        ));
        let gateway: Arc<dyn PushGateway> = Arc::new(SimulatedGateway::new(
            "mpesa",
            success_rate,
            Duration::from_millis(20),
            callbacks,
        ));
        let checkout = CheckoutClient::new(
            reqwest::Client::new(),
            CheckoutSettings {
                endpoint: String::new(),
                api_key: String::new(),
            },
        );
        let poller = StatusPoller::new(
            Arc::clone(&store) as Arc<dyn StatusSource>,
            PollerSettings {
                grace_period: Duration::from_millis(5),
                poll_interval: Duration::from_millis(5),
                max_attempts: 3,
            },
        );
        let initiator = PaymentInitiator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            gateway,
            checkout,
            poller,
        );
        (store, initiator)
    }

    fn premium_request() -> InitiateRequest {
        InitiateRequest {
            user_id: "u1".to_string(),
            amount: 799,
            currency: "KES".to_string(),
            method: PaymentMethod::Mpesa,
            phone_number: Some("254712345678".to_string()),
            subscription_tier: "Premium".to_string(),
        }
    }

    async fn wait_for_terminal(
        store: &crate::payments::store::PaymentStore,
        reference: &str,
    ) -> crate::payments::types::PaymentRecord {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(record) = store.get_payment_by_reference(reference).unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
        }
        panic!("payment never reached a terminal status");
    }

    #[tokio::test]
    async fn test_simulated_success_completes_and_extends_subscription() {
        let (store, initiator) = harness(1.0);

        let response = initiator.initiate(premium_request()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.status, PaymentStatus::Pending);

        let record = wait_for_terminal(&store, &response.transaction_id).await;
        assert_eq!(record.status, PaymentStatus::Completed);
        assert!(record.receipt.is_some());

        let sub = store.get_subscription("u1").unwrap().unwrap();
        assert!(sub.active);
        assert_eq!(sub.tier, "Premium");
        let days_ahead = (sub.period_end - Utc::now()).num_days();
        assert!((27..=32).contains(&days_ahead), "period_end {days_ahead} days out");
    }

    #[tokio::test]
    async fn test_simulated_failure_leaves_no_subscription() {
        let (store, initiator) = harness(0.0);

        let response = initiator.initiate(premium_request()).await.unwrap();
        assert!(response.success);

        let record = wait_for_terminal(&store, &response.transaction_id).await;
        assert_eq!(record.status, PaymentStatus::Failed);
        assert!(store.get_subscription("u1").unwrap().is_none());
    }
}
