// Airtel Money collections client
// OAuth token fetch plus the merchant push-payment endpoint. The transaction
// id is generated locally and doubles as the provider reference.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::payments::errors::{is_transient, GatewayApiError};
use crate::payments::{PushGateway, PushRequest};
use crate::settings::AirtelSettings;

#[derive(Clone)]
pub struct AirtelClient {
    http: Client,
    cfg: AirtelSettings,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

#[derive(Debug, Serialize)]
struct OauthTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct PushPaymentRequest<'a> {
    reference: &'a str,
    subscriber: Subscriber<'a>,
    transaction: Transaction<'a>,
}

#[derive(Debug, Serialize)]
struct Subscriber<'a> {
    country: &'a str,
    currency: &'a str,
    msisdn: &'a str,
}

#[derive(Debug, Serialize)]
struct Transaction<'a> {
    amount: i64,
    country: &'a str,
    currency: &'a str,
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PushPaymentResponse {
    status: AirtelStatus,
}

#[derive(Debug, Deserialize)]
struct AirtelStatus {
    #[serde(default)]
    code: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

impl AirtelClient {
    pub fn new(http: Client, cfg: AirtelSettings) -> Self {
        Self {
            http,
            cfg,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayApiError {
        if let Ok(response) = serde_json::from_str::<PushPaymentResponse>(body) {
            GatewayApiError::Rejected {
                code: response.status.code,
                message: response.status.message,
                status: Some(status.as_u16()),
            }
        } else {
            GatewayApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    async fn with_retries<F, Fut, T>(&self, desc: &str, mut op: F) -> Result<T, GatewayApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayApiError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !is_transient(&e) || attempt >= self.max_retries {
                        return Err(e);
                    }

                    let exp = self
                        .base_delay_ms
                        .saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(self.max_delay_ms.max(self.base_delay_ms));
                    let mut rng = SmallRng::from_entropy();
                    let delay_ms = if cap > self.base_delay_ms {
                        rng.gen_range(self.base_delay_ms..=cap)
                    } else {
                        self.base_delay_ms
                    };

                    warn!(
                        target: "airtel",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        next_delay_ms = delay_ms,
                        "retrying transient Airtel error"
                    );

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // POST /auth/oauth2/token
    async fn access_token(&self) -> Result<String, GatewayApiError> {
        let url = format!("{}/auth/oauth2/token", self.cfg.base_url);
        let body = OauthTokenRequest {
            client_id: &self.cfg.client_id,
            client_secret: &self.cfg.client_secret,
            grant_type: "client_credentials",
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayApiError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayApiError::Decode(e.to_string()))?;
        if status.is_success() {
            let token: OauthTokenResponse =
                serde_json::from_str(&text).map_err(|e| GatewayApiError::Decode(e.to_string()))?;
            Ok(token.access_token)
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    // POST /merchant/v1/payments/
    #[instrument(skip(self), fields(method = "POST", path = "/merchant/v1/payments/"))]
    pub async fn push_payment(
        &self,
        phone_number: &str,
        amount: i64,
        transaction_id: &str,
        account_reference: &str,
    ) -> Result<(), GatewayApiError> {
        if self.cfg.client_id.is_empty() {
            return Err(GatewayApiError::Precondition(
                "Airtel credentials not configured",
            ));
        }

        // Airtel takes the national-format msisdn without the country prefix.
        let msisdn = phone_number
            .strip_prefix("254")
            .unwrap_or(phone_number)
            .to_string();

        let body = PushPaymentRequest {
            reference: account_reference,
            subscriber: Subscriber {
                country: &self.cfg.country,
                currency: &self.cfg.currency,
                msisdn: &msisdn,
            },
            transaction: Transaction {
                amount,
                country: &self.cfg.country,
                currency: &self.cfg.currency,
                id: transaction_id,
            },
        };

        info!(
            target: "airtel",
            method = "POST",
            path = "/merchant/v1/payments/",
            amount = amount,
            transaction_id = %transaction_id,
            "airtel request"
        );

        let token = self.access_token().await?;

        let req_builder = || {
            let url = format!("{}/merchant/v1/payments/", self.cfg.base_url);
            let req = self
                .http
                .post(url)
                .bearer_auth(&token)
                .header("X-Country", &self.cfg.country)
                .header("X-Currency", &self.cfg.currency)
                .json(&body);
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| GatewayApiError::Http(e.to_string()))?;
                let status = resp.status();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| GatewayApiError::Decode(e.to_string()))?;
                if status.is_success() {
                    serde_json::from_str::<PushPaymentResponse>(&text)
                        .map_err(|e| GatewayApiError::Decode(e.to_string()))
                } else {
                    Err(Self::map_error(status, &text))
                }
            }
        };
        let response = self.with_retries("push_payment", req_builder).await?;

        if !response.status.success {
            return Err(GatewayApiError::Rejected {
                code: response.status.code,
                message: response.status.message,
                status: None,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PushGateway for AirtelClient {
    fn name(&self) -> &'static str {
        "airtel_money"
    }

    async fn initiate_push(&self, request: &PushRequest) -> Result<String, GatewayApiError> {
        if request.currency != self.cfg.currency {
            return Err(GatewayApiError::Precondition(
                "currency not supported by the Airtel merchant account",
            ));
        }
        // Airtel wants the caller to mint the transaction id, so it is the
        // provider reference.
        let transaction_id = format!("AM{}", Uuid::new_v4().simple());
        self.push_payment(
            &request.phone_number,
            request.amount_minor_units,
            &transaction_id,
            &request.account_reference,
        )
        .await?;
        Ok(transaction_id)
    }
}
