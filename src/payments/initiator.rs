// Payment initiation: validates the charge request, dispatches the provider
// push, and records the attempt. Terminal state for push payments is written
// by the callback processor only; the initiator writes `failed` directly
// only when the push itself cannot be dispatched, so no record is ever
// stranded `pending` by a provider outage.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::payment_counter_inc;
use crate::payments::checkout::CheckoutClient;
use crate::payments::errors::PaymentError;
use crate::payments::poller::{PollOutcome, StatusPoller};
use crate::payments::types::{
    require_currency_code, require_phone_number, require_positive_minor_units, InitiateRequest,
    InitiateResponse, PaymentMethod, PaymentRecord, PaymentStatus,
};
use crate::payments::{PushGateway, PushRequest};
use crate::payments::store::PaymentStore;

pub struct PaymentInitiator {
    store: Arc<PaymentStore>,
    mpesa: Arc<dyn PushGateway>,
    airtel: Arc<dyn PushGateway>,
    checkout: CheckoutClient,
    poller: StatusPoller,
    shutdown: CancellationToken,
}

impl PaymentInitiator {
    pub fn new(
        store: Arc<PaymentStore>,
        mpesa: Arc<dyn PushGateway>,
        airtel: Arc<dyn PushGateway>,
        checkout: CheckoutClient,
        poller: StatusPoller,
    ) -> Self {
        Self {
            store,
            mpesa,
            airtel,
            checkout,
            poller,
            shutdown: CancellationToken::new(),
        }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id, method = request.method.as_str()))]
    pub async fn initiate(&self, request: InitiateRequest) -> Result<InitiateResponse, PaymentError> {
        require_positive_minor_units(request.amount)?;
        require_currency_code(&request.currency)?;

        match request.method {
            PaymentMethod::Card => self.initiate_card(request).await,
            PaymentMethod::Mpesa => {
                let gateway = Arc::clone(&self.mpesa);
                self.initiate_push(request, gateway).await
            }
            PaymentMethod::AirtelMoney => {
                let gateway = Arc::clone(&self.airtel);
                self.initiate_push(request, gateway).await
            }
        }
    }

    /// Card payments delegate to the hosted checkout; its processor owns the
    /// whole lifecycle, so nothing is recorded here.
    async fn initiate_card(&self, request: InitiateRequest) -> Result<InitiateResponse, PaymentError> {
        let session = self
            .checkout
            .create_session(
                &request.user_id,
                request.amount,
                &request.currency,
                &request.subscription_tier,
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "checkout session creation failed");
                PaymentError::Provider(e.to_string())
            })?;

        payment_counter_inc!("payments.checkout.created");

        Ok(InitiateResponse {
            success: true,
            transaction_id: session.id.unwrap_or_default(),
            status: PaymentStatus::Pending,
            message: "Redirect to checkout to complete payment".to_string(),
            redirect_url: Some(session.url),
        })
    }

    async fn initiate_push(
        &self,
        request: InitiateRequest,
        gateway: Arc<dyn PushGateway>,
    ) -> Result<InitiateResponse, PaymentError> {
        // Validation happens before anything is written.
        let phone_number = require_phone_number(request.phone_number.as_deref())?.to_string();

        let id = Uuid::new_v4().to_string();
        let push = PushRequest {
            phone_number,
            amount_minor_units: request.amount,
            currency: request.currency.clone(),
            account_reference: id.clone(),
        };

        match gateway.initiate_push(&push).await {
            Ok(provider_reference) => {
                let record = PaymentRecord {
                    id,
                    user_id: request.user_id,
                    amount_minor_units: request.amount,
                    currency: request.currency,
                    method: request.method,
                    status: PaymentStatus::Pending,
                    provider: gateway.name().to_string(),
                    provider_reference,
                    subscription_tier: request.subscription_tier,
                    receipt: None,
                    created_at: Utc::now(),
                    finalized_at: None,
                };
                // If this insert fails the push is already out; the eventual
                // callback lands as an unknown reference and is acknowledged
                // and logged, never silently dropped.
                self.store.insert_payment(&record)?;

                payment_counter_inc!("payments.initiated", "method" => gateway.name());
                info!(
                    provider_reference = %record.provider_reference,
                    "push dispatched, awaiting provider callback"
                );

                self.watch_confirmation(record.provider_reference.clone());

                Ok(InitiateResponse {
                    success: true,
                    transaction_id: record.provider_reference,
                    status: PaymentStatus::Pending,
                    message: "Push sent. Enter your PIN on the handset to confirm.".to_string(),
                    redirect_url: None,
                })
            }
            Err(e) => {
                warn!(error = %e, "push dispatch failed");

                let record = PaymentRecord {
                    id: id.clone(),
                    user_id: request.user_id,
                    amount_minor_units: request.amount,
                    currency: request.currency,
                    method: request.method,
                    status: PaymentStatus::Failed,
                    provider: gateway.name().to_string(),
                    provider_reference: id,
                    subscription_tier: request.subscription_tier,
                    receipt: None,
                    created_at: Utc::now(),
                    finalized_at: Some(Utc::now()),
                };
                self.store.insert_payment(&record)?;

                payment_counter_inc!("payments.dispatch_failed", "method" => gateway.name());

                Ok(InitiateResponse {
                    success: false,
                    transaction_id: record.provider_reference,
                    status: PaymentStatus::Failed,
                    message: "Payment could not be initiated. Please try again.".to_string(),
                    redirect_url: None,
                })
            }
        }
    }

    /// Server-side confirmation watch: timeouts land in the logs even when
    /// the client stops polling.
    fn watch_confirmation(&self, provider_reference: String) {
        let poller = self.poller.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            match poller.poll(&provider_reference, cancel).await {
                PollOutcome::TimedOut => {
                    warn!(
                        provider_reference = %provider_reference,
                        "confirmation window elapsed without a provider callback"
                    );
                    payment_counter_inc!("payments.confirmation.timed_out");
                }
                outcome => {
                    debug!(
                        provider_reference = %provider_reference,
                        outcome = ?outcome,
                        "confirmation watch resolved"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::errors::GatewayApiError;
    use crate::payments::poller::StatusSource;
    use crate::payments::store::test_support::temp_store;
    use crate::settings::{CheckoutSettings, PollerSettings};
    use std::time::Duration;

    struct AcceptingGateway;

    #[async_trait::async_trait]
    impl PushGateway for AcceptingGateway {
        fn name(&self) -> &'static str {
            "mpesa"
        }

        async fn initiate_push(&self, _request: &PushRequest) -> Result<String, GatewayApiError> {
            Ok("ws_CO_TEST".to_string())
        }
    }

    struct UnreachableGateway;

    #[async_trait::async_trait]
    impl PushGateway for UnreachableGateway {
        fn name(&self) -> &'static str {
            "mpesa"
        }

        async fn initiate_push(&self, _request: &PushRequest) -> Result<String, GatewayApiError> {
            Err(GatewayApiError::Http("connection refused".to_string()))
        }
    }

    fn initiator_with(gateway: Arc<dyn PushGateway>) -> (Arc<PaymentStore>, PaymentInitiator) {
        let store = Arc::new(temp_store());
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
                max_attempts: 2,
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

    fn push_request(phone_number: Option<&str>) -> InitiateRequest {
        InitiateRequest {
            user_id: "u1".to_string(),
            amount: 799,
            currency: "KES".to_string(),
            method: PaymentMethod::Mpesa,
            phone_number: phone_number.map(str::to_string),
            subscription_tier: "Premium".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_phone_number_writes_nothing() {
        let (store, initiator) = initiator_with(Arc::new(AcceptingGateway));

        let result = initiator.initiate(push_request(Some(""))).await;
        assert!(matches!(result, Err(PaymentError::Validation(_))));
        assert_eq!(store.count_payments(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let (store, initiator) = initiator_with(Arc::new(AcceptingGateway));

        let mut request = push_request(Some("254712345678"));
        request.amount = 0;
        let result = initiator.initiate(request).await;
        assert!(matches!(result, Err(PaymentError::Validation(_))));
        assert_eq!(store.count_payments(), 0);
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_pending() {
        let (store, initiator) = initiator_with(Arc::new(AcceptingGateway));

        let response = initiator
            .initiate(push_request(Some("254712345678")))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.status, PaymentStatus::Pending);
        assert_eq!(response.transaction_id, "ws_CO_TEST");

        let record = store
            .get_payment_by_reference("ws_CO_TEST")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Pending);
        assert_eq!(record.provider, "mpesa");
        assert_eq!(record.subscription_tier, "Premium");
        assert!(record.finalized_at.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_records_failed_not_pending() {
        let (store, initiator) = initiator_with(Arc::new(UnreachableGateway));

        let response = initiator
            .initiate(push_request(Some("254712345678")))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.status, PaymentStatus::Failed);
        assert!(!response.message.contains("connection refused"));

        let record = store
            .get_payment_by_reference(&response.transaction_id)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert!(record.finalized_at.is_some());
    }

    #[tokio::test]
    async fn test_card_without_checkout_collaborator() {
        let (store, initiator) = initiator_with(Arc::new(AcceptingGateway));

        let mut request = push_request(None);
        request.method = PaymentMethod::Card;
        let result = initiator.initiate(request).await;
        assert!(matches!(result, Err(PaymentError::Provider(_))));
        assert_eq!(store.count_payments(), 0);
    }
}
