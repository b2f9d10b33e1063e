// Mobile-money payment processing module

pub mod airtel;
pub mod callback;
pub mod checkout;
pub mod daraja;
pub mod errors;
pub mod initiator;
pub mod metrics;
pub mod poller;
pub mod simulate;
pub mod store;
pub mod types;

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::Config;
use self::airtel::AirtelClient;
use self::callback::{CallbackProcessor, NullDirectory};
use self::checkout::CheckoutClient;
use self::daraja::DarajaClient;
use self::errors::GatewayApiError;
use self::initiator::PaymentInitiator;
use self::poller::{StatusPoller, StatusSource};
use self::simulate::SimulatedGateway;
use self::store::PaymentStore;

/// A push-based mobile-money gateway: asks the provider to prompt the
/// subscriber's handset and returns the provider's correlation reference.
/// The outcome arrives later through the provider callback, never here.
#[async_trait::async_trait]
pub trait PushGateway: Send + Sync {
    fn name(&self) -> &'static str;
    async fn initiate_push(&self, request: &PushRequest) -> Result<String, GatewayApiError>;
}

/// Input to a push gateway dispatch.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub phone_number: String,
    pub amount_minor_units: i64,
    pub currency: String,
    /// Local payment id, surfaced to the provider as the account reference.
    pub account_reference: String,
}

/// Assembled payment flow: store, gateways, and the three protocol roles.
pub struct Payments {
    pub store: Arc<PaymentStore>,
    pub initiator: PaymentInitiator,
    pub callbacks: Arc<CallbackProcessor>,
}

impl Payments {
    // Build reqwest client with rustls and timeout from cfg, wire gateways
    // per configuration (live Daraja/Airtel, or the simulator in demo mode).
    pub fn new(cfg: &Config, store: Arc<PaymentStore>) -> Result<Self, GatewayApiError> {
        let timeout = Duration::from_millis(if cfg.daraja.timeout_ms > 0 {
            cfg.daraja.timeout_ms
        } else {
            15_000
        });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayApiError::Http(e.to_string()))?;

        let callbacks = Arc::new(CallbackProcessor::new(
            Arc::clone(&store),
            Arc::new(NullDirectory),
        ));

        let (mpesa, airtel): (Arc<dyn PushGateway>, Arc<dyn PushGateway>) =
            if cfg.simulation.enabled {
                (
                    Arc::new(SimulatedGateway::new(
                        "mpesa",
                        cfg.simulation.mpesa_success_rate,
                        cfg.simulation.callback_delay,
                        Arc::clone(&callbacks),
                    )),
                    Arc::new(SimulatedGateway::new(
                        "airtel_money",
                        cfg.simulation.airtel_success_rate,
                        cfg.simulation.callback_delay,
                        Arc::clone(&callbacks),
                    )),
                )
            } else {
                (
                    Arc::new(DarajaClient::new(http.clone(), cfg.daraja.clone())),
                    Arc::new(AirtelClient::new(http.clone(), cfg.airtel.clone())),
                )
            };

        let checkout = CheckoutClient::new(http, cfg.checkout.clone());
        let poller = StatusPoller::new(
            Arc::clone(&store) as Arc<dyn StatusSource>,
            cfg.poller.clone(),
        );
        let initiator = PaymentInitiator::new(Arc::clone(&store), mpesa, airtel, checkout, poller);

        Ok(Self {
            store,
            initiator,
            callbacks,
        })
    }
}
