// Error types for the payment flow and gateway transports

use thiserror::Error;

use crate::payments::types::PreconditionError;

/// Errors surfaced by the initiation and status surfaces.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("unknown provider reference: {0}")]
    NotFound(String),
}

impl PaymentError {
    /// Map to an HTTP status code for the API surface.
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::Validation(_) => 400,
            PaymentError::NotFound(_) => 404,
            PaymentError::Persistence(_) => 500,
            PaymentError::Provider(_) => 502,
        }
    }

    /// Message safe to show an end user. Store and gateway internals stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            PaymentError::Validation(_) | PaymentError::NotFound(_) => self.to_string(),
            PaymentError::Persistence(_) => "Payment service is temporarily unavailable".to_string(),
            PaymentError::Provider(_) => "Payment provider is unavailable".to_string(),
        }
    }
}

impl From<PreconditionError> for PaymentError {
    fn from(e: PreconditionError) -> Self {
        PaymentError::Validation(e.to_string())
    }
}

/// Transport-level errors from the gateway REST clients.
#[derive(Debug, Error)]
pub enum GatewayApiError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("gateway rejected request: code={code} message={message} status={status:?}")]
    Rejected {
        code: String,
        message: String,
        status: Option<u16>,
    },
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
}

/// Whether an error is worth retrying: transport failures and 5xx responses.
/// Business rejections (bad credentials, invalid subscriber) are permanent.
pub fn is_transient(e: &GatewayApiError) -> bool {
    match e {
        GatewayApiError::Http(_) => true,
        GatewayApiError::Rejected {
            status: Some(status),
            ..
        } => (500..600).contains(status),
        _ => false,
    }
}
