// Card checkout collaborator
// Creates a hosted checkout session with the external card processor and
// returns the redirect URL. The card flow's lifecycle is owned entirely by
// that processor; no local payment record is written for it.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::payments::errors::GatewayApiError;
use crate::settings::CheckoutSettings;

#[derive(Clone)]
pub struct CheckoutClient {
    http: Client,
    cfg: CheckoutSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    user_id: &'a str,
    amount: i64,
    currency: &'a str,
    subscription_tier: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
}

impl CheckoutClient {
    pub fn new(http: Client, cfg: CheckoutSettings) -> Self {
        Self { http, cfg }
    }

    #[instrument(skip(self), fields(user_id = %user_id, amount = amount))]
    pub async fn create_session(
        &self,
        user_id: &str,
        amount: i64,
        currency: &str,
        subscription_tier: &str,
    ) -> Result<CheckoutSession, GatewayApiError> {
        if self.cfg.endpoint.is_empty() {
            return Err(GatewayApiError::Precondition(
                "checkout endpoint not configured",
            ));
        }

        info!(target: "checkout", user_id = %user_id, "creating checkout session");

        let body = CreateSessionRequest {
            user_id,
            amount,
            currency,
            subscription_tier,
        };
        let resp = self
            .http
            .post(&self.cfg.endpoint)
            .bearer_auth(&self.cfg.api_key)
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
            serde_json::from_str(&text).map_err(|e| GatewayApiError::Decode(e.to_string()))
        } else {
            Err(GatewayApiError::Http(format!(
                "status={} body={}",
                status.as_u16(),
                text
            )))
        }
    }
}
