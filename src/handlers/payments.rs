use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::entities::payment;
use crate::services::daraja::DarajaCallback;
use crate::services::payments::InitiatePaymentInput;
use crate::{ApiResponse, ApiResult, AppState};

/// POST /payments/daraja/initiate
///
/// Starts an STK push for a pending order.
#[utoipa::path(
    post,
    path = "/api/v1/payments/daraja/initiate",
    request_body = InitiatePaymentInput,
    responses(
        (status = 200, description = "Push sent, payment pending"),
        (status = 400, description = "Bad phone number or amount mismatch"),
        (status = 404, description = "Unknown order"),
        (status = 409, description = "Order already paid"),
        (status = 500, description = "Gateway unavailable")
    ),
    tag = "payments"
)]
pub async fn initiate_daraja_payment(
    State(state): State<AppState>,
    Json(input): Json<InitiatePaymentInput>,
) -> ApiResult<payment::Model> {
    let payment_model = state.services.payments.initiate(input).await?;
    Ok(Json(ApiResponse::success(payment_model)))
}

/// POST /payments/daraja/callback
///
/// Daraja notification webhook. Always answers 200 with a success-shaped
/// body: a non-200 would make the provider retry or disable the URL, and
/// every internal failure is recoverable from the logs.
#[utoipa::path(
    post,
    path = "/api/v1/payments/daraja/callback",
    request_body = DarajaCallback,
    responses((status = 200, description = "Always acknowledged")),
    tag = "payments"
)]
pub async fn daraja_callback(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    match serde_json::from_slice::<DarajaCallback>(&body) {
        Ok(envelope) => {
            let notification = envelope.body.stk_callback.into_notification();
            if let Err(e) = state.services.payments.handle_notification(notification).await {
                error!(error = %e, "Payment notification processing failed");
            }
        }
        Err(e) => {
            warn!(error = %e, "Unparseable payment notification, ignoring");
        }
    }

    Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
}
