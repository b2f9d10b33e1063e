// Domain records, wire DTOs, and input preconditions for the payment flow
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payment method selected by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Mpesa,
    AirtelMoney,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::AirtelMoney => "airtel_money",
        }
    }

    /// Push methods prompt the subscriber's handset and resolve through an
    /// asynchronous provider callback.
    pub fn is_push(&self) -> bool {
        matches!(self, PaymentMethod::Mpesa | PaymentMethod::AirtelMoney)
    }
}

/// Lifecycle status of a payment record.
/// `Completed` and `Failed` are terminal and never transition again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// One payment attempt and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub user_id: String,
    pub amount_minor_units: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Gateway that owns `provider_reference` ("mpesa", "airtel_money").
    pub provider: String,
    /// Correlation key matching an asynchronous callback to this record.
    pub provider_reference: String,
    pub subscription_tier: String,
    /// Provider receipt number captured from callback metadata, for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// At most one row per user; overwritten wholesale on each successful payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub tier: String,
    pub active: bool,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("phone number is required for push payments")]
    MissingPhoneNumber,
    #[error("amount must be positive minor units")]
    InvalidAmount,
    #[error("currency must be a three-letter code")]
    InvalidCurrency,
}

/// Push methods need a dialable subscriber number before anything is written.
pub fn require_phone_number(phone: Option<&str>) -> Result<&str, PreconditionError> {
    match phone {
        Some(p) if !p.trim().is_empty() => Ok(p),
        _ => Err(PreconditionError::MissingPhoneNumber),
    }
}

pub fn require_positive_minor_units(amount: i64) -> Result<(), PreconditionError> {
    if amount <= 0 {
        return Err(PreconditionError::InvalidAmount);
    }
    Ok(())
}

pub fn require_currency_code(currency: &str) -> Result<(), PreconditionError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(PreconditionError::InvalidCurrency);
    }
    Ok(())
}

// Initiation API DTOs (camelCase wire shape used by the app client)

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub user_id: String,
    /// Amount in the currency's smallest unit.
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub method: PaymentMethod,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub subscription_tier: String,
}

fn default_currency() -> String {
    "KES".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub success: bool,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub message: String,
    /// Present for card payments only: the hosted checkout URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

// Daraja STK wire shapes. Field casing is dictated by the provider.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushRequest {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: String,
    pub amount: i64,
    pub party_a: String,
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    pub response_code: String,
    pub response_description: String,
    #[serde(default)]
    pub customer_message: Option<String>,
}

/// Callback envelope delivered by the provider when a push resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: String,
    #[serde(default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

/// Flat list of named items; lookups tolerate missing entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataItem {
    pub name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl CallbackMetadata {
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.item
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
    }

    /// String form of a named item; numbers are rendered without quotes.
    pub fn string_value(&self, name: &str) -> Option<String> {
        match self.value(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn amount(&self) -> Option<i64> {
        match self.value("Amount")? {
            serde_json::Value::Number(n) => n.as_f64().map(|f| f.round() as i64),
            serde_json::Value::String(s) => s.parse::<f64>().ok().map(|f| f.round() as i64),
            _ => None,
        }
    }

    pub fn receipt(&self) -> Option<String> {
        self.string_value("MpesaReceiptNumber")
    }

    pub fn phone_number(&self) -> Option<String> {
        self.string_value("PhoneNumber")
    }
}

/// Protocol acknowledgement returned to the provider. Its code reflects
/// whether the delivery was processed, not whether the payment succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn processed() -> Self {
        Self {
            result_code: 0,
            result_desc: "Callback processed".to_string(),
        }
    }

    pub fn internal_error() -> Self {
        Self {
            result_code: 1,
            result_desc: "Callback received but could not be processed".to_string(),
        }
    }
}
