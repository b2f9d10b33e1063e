// M-Pesa Daraja REST client
// Implements the OAuth client-credentials token fetch and the STK push
// endpoint, with bounded retries for transient transport errors.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use tracing::{info, instrument, warn};

use crate::payments::errors::{is_transient, GatewayApiError};
use crate::payments::types::{StkPushRequest, StkPushResponse};
use crate::payments::{PushGateway, PushRequest};
use crate::settings::DarajaSettings;

#[derive(Clone)]
pub struct DarajaClient {
    http: Client,
    cfg: DarajaSettings,
    // Retry knobs with safe defaults
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
}

// Daraja error envelope: { requestId, errorCode, errorMessage }
#[derive(Debug, Deserialize)]
struct DarajaErrorEnvelope {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(rename = "errorMessage")]
    error_message: String,
}

impl DarajaClient {
    pub fn new(http: Client, cfg: DarajaSettings) -> Self {
        Self {
            http,
            cfg,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayApiError {
        if let Ok(envelope) = serde_json::from_str::<DarajaErrorEnvelope>(body) {
            GatewayApiError::Rejected {
                code: envelope.error_code,
                message: envelope.error_message,
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

                    // Exponential backoff with full jitter
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
                        target: "daraja",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        next_delay_ms = delay_ms,
                        "retrying transient Daraja error"
                    );

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // GET /oauth/v1/generate?grant_type=client_credentials
    async fn access_token(&self) -> Result<String, GatewayApiError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.cfg.base_url
        );
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.cfg.consumer_key, Some(&self.cfg.consumer_secret))
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

    /// STK password: base64(shortcode + passkey + timestamp).
    fn stk_password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.cfg.short_code, self.cfg.passkey, timestamp
        ))
    }

    // POST /mpesa/stkpush/v1/processrequest
    #[instrument(skip(self), fields(method = "POST", path = "/mpesa/stkpush/v1/processrequest"))]
    pub async fn stk_push(
        &self,
        phone_number: &str,
        amount: i64,
        account_reference: &str,
    ) -> Result<StkPushResponse, GatewayApiError> {
        if self.cfg.consumer_key.is_empty() || self.cfg.passkey.is_empty() {
            return Err(GatewayApiError::Precondition(
                "Daraja credentials not configured",
            ));
        }

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let body = StkPushRequest {
            business_short_code: self.cfg.short_code.clone(),
            password: self.stk_password(&timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: phone_number.to_string(),
            party_b: self.cfg.short_code.clone(),
            phone_number: phone_number.to_string(),
            callback_url: self.cfg.callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: "Haraka-Afya subscription".to_string(),
        };

        info!(
            target: "daraja",
            method = "POST",
            path = "/mpesa/stkpush/v1/processrequest",
            amount = amount,
            account_reference = %account_reference,
            "daraja request"
        );

        let token = self.access_token().await?;

        let req_builder = || {
            let url = format!("{}/mpesa/stkpush/v1/processrequest", self.cfg.base_url);
            let req = self.http.post(url).bearer_auth(&token).json(&body);
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
                    serde_json::from_str::<StkPushResponse>(&text)
                        .map_err(|e| GatewayApiError::Decode(e.to_string()))
                } else {
                    Err(Self::map_error(status, &text))
                }
            }
        };
        let response = self.with_retries("stk_push", req_builder).await?;

        // An accepted push has ResponseCode "0"; anything else never reached
        // the subscriber.
        if response.response_code != "0" {
            return Err(GatewayApiError::Rejected {
                code: response.response_code,
                message: response.response_description,
                status: None,
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl PushGateway for DarajaClient {
    fn name(&self) -> &'static str {
        "mpesa"
    }

    async fn initiate_push(&self, request: &PushRequest) -> Result<String, GatewayApiError> {
        // M-Pesa settles in Kenyan shillings only.
        if request.currency != "KES" {
            return Err(GatewayApiError::Precondition("M-Pesa supports KES only"));
        }
        let response = self
            .stk_push(
                &request.phone_number,
                request.amount_minor_units,
                &request.account_reference,
            )
            .await?;
        Ok(response.checkout_request_id)
    }
}
