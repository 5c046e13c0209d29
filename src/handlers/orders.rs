use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus};
use crate::{ApiResponse, ApiResult, AppState, PaginatedResponse};

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    #[serde(default = "crate::default_page")]
    pub page: u64,
    #[serde(default = "crate::default_limit")]
    pub limit: u64,
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusInput {
    pub status: OrderStatus,
}

/// GET /orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    responses((status = 200, description = "Orders page")),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> ApiResult<PaginatedResponse<order::Model>> {
    let (orders, total) = state
        .services
        .orders
        .list_orders(query.page, query.limit, query.status)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders,
        total,
        query.page,
        query.limit,
    ))))
}

/// GET /orders/:id
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    responses(
        (status = 200, description = "Order with items"),
        (status = 404, description = "Unknown order")
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::services::orders::OrderWithItems> {
    let outcome = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// PUT /orders/:id/status
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    request_body = UpdateOrderStatusInput,
    responses(
        (status = 200, description = "Status updated"),
        (status = 400, description = "Illegal transition"),
        (status = 404, description = "Unknown order")
    ),
    tag = "orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateOrderStatusInput>,
) -> ApiResult<order::Model> {
    let updated = state.services.orders.update_status(id, input.status).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// POST /orders/:id/cancel
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    responses(
        (status = 200, description = "Order cancelled, holds released"),
        (status = 400, description = "Order can no longer be cancelled"),
        (status = 404, description = "Unknown order")
    ),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<order::Model> {
    let updated = state
        .services
        .orders
        .cancel_order(id, crate::entities::inventory_log::InventorySource::AdminPanel)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}
