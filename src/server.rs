// HTTP server for payment initiation, provider callbacks, and status reads

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::payments::callback::CallbackProcessor;
use crate::payments::errors::PaymentError;
use crate::payments::initiator::PaymentInitiator;
use crate::payments::store::PaymentStore;
use crate::payments::types::{CallbackAck, InitiateRequest, StkCallbackEnvelope};

#[derive(Clone)]
pub struct ApiState {
    pub initiator: Arc<PaymentInitiator>,
    pub callbacks: Arc<CallbackProcessor>,
    pub store: Arc<PaymentStore>,
}

pub async fn run_server(port: u16, state: ApiState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/payments/initiate", post(initiate_payment))
        .route("/payments/callback", post(provider_callback))
        .route("/payments/:reference/status", get(payment_status))
        .route("/health", get(health_check))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting payment HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn initiate_payment(
    State(state): State<ApiState>,
    Json(request): Json<InitiateRequest>,
) -> Response {
    match state.initiator.initiate(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!("Payment initiation rejected: {}", e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({ "success": false, "message": e.public_message() })),
            )
                .into_response()
        }
    }
}

/// Provider deliveries are answered with HTTP 200 no matter what; the ack
/// body carries the processing result. An unparseable payload is logged and
/// acked so the provider does not retry it forever.
async fn provider_callback(State(state): State<ApiState>, body: Bytes) -> impl IntoResponse {
    let ack = match serde_json::from_slice::<StkCallbackEnvelope>(&body) {
        Ok(envelope) => state.callbacks.process(envelope).await,
        Err(e) => {
            error!("Unparseable provider callback payload: {}", e);
            CallbackAck::internal_error()
        }
    };
    (StatusCode::OK, Json(ack))
}

async fn payment_status(State(state): State<ApiState>, Path(reference): Path<String>) -> Response {
    let result = state
        .store
        .get_payment_by_reference(&reference)
        .and_then(|record| record.ok_or_else(|| PaymentError::NotFound(reference.clone())));

    match result {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({
                "transactionId": record.provider_reference,
                "status": record.status,
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Status read failed: {}", e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "message": e.public_message() }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::callback::NullDirectory;
    use crate::payments::checkout::CheckoutClient;
    use crate::payments::poller::{StatusPoller, StatusSource};
    use crate::payments::simulate::SimulatedGateway;
    use crate::payments::store::test_support::{sample_record, temp_store};
    use crate::payments::PushGateway;
    use crate::settings::{CheckoutSettings, PollerSettings};
    use std::time::Duration;

    fn test_state() -> ApiState {
        let store = Arc::new(temp_store());
        let callbacks = Arc::new(CallbackProcessor::new(
            Arc::clone(&store),
            Arc::new(NullDirectory),
        ));
        let gateway: Arc<dyn PushGateway> = Arc::new(SimulatedGateway::new(
            "mpesa",
            1.0,
            Duration::from_millis(10),
            Arc::clone(&callbacks),
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
                max_attempts: 2,
            },
        );
        let initiator = Arc::new(PaymentInitiator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            gateway,
            checkout,
            poller,
        ));
        ApiState {
            initiator,
            callbacks,
            store,
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_callback_with_garbage_body_still_acks() {
        let state = test_state();
        let body = Bytes::from("not even json");

        let response = provider_callback(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ack: CallbackAck = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack.result_code, 1);
    }

    #[tokio::test]
    async fn test_callback_for_unknown_reference_acks_success() {
        let state = test_state();
        let body = Bytes::from(
            r#"{"Body":{"stkCallback":{
                "MerchantRequestID":"m1",
                "CheckoutRequestID":"ws_CO_unknown",
                "ResultCode":0,
                "ResultDesc":"ok"
            }}}"#,
        );

        let response = provider_callback(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ack: CallbackAck = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack.result_code, 0);
    }

    #[tokio::test]
    async fn test_initiate_rejects_missing_phone_with_400() {
        let state = test_state();
        let request: InitiateRequest = serde_json::from_str(
            r#"{
                "userId": "u1",
                "amount": 799,
                "method": "mpesa",
                "phoneNumber": "",
                "subscriptionTier": "Premium"
            }"#,
        )
        .unwrap();

        let response = initiate_payment(State(state), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_endpoint_reads_record() {
        let state = test_state();
        state
            .store
            .insert_payment(&sample_record("ws_CO_status"))
            .unwrap();

        let response =
            payment_status(State(state.clone()), Path("ws_CO_status".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = payment_status(State(state), Path("ws_CO_nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
