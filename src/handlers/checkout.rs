use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::errors::ServiceError;
use crate::services::orders::{CheckoutInput, OrderWithItems};
use crate::{ApiResponse, AppState};

/// POST /checkout
///
/// Creates a PENDING order from a cart, reserving stock for every line.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutInput,
    responses(
        (status = 201, description = "Order created"),
        (status = 400, description = "Empty cart, bad quantity, price or total mismatch, or out of stock"),
        (status = 404, description = "Unknown variant")
    ),
    tag = "checkout"
)]
pub async fn checkout(
    State(state): State<AppState>,
    Json(input): Json<CheckoutInput>,
) -> Result<(StatusCode, Json<ApiResponse<OrderWithItems>>), ServiceError> {
    let outcome = state.services.orders.checkout(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(outcome))))
}
