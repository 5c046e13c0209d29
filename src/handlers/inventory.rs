use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{inventory_log::InventorySource, variant};
use crate::services::inventory::InventoryRow;
use crate::{ApiResponse, ApiResult, AppState, ListQuery, PaginatedResponse};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetStockInput {
    pub variant_id: Uuid,
    pub inventory_count: i32,
}

/// GET /admin/inventory
#[utoipa::path(
    get,
    path = "/api/v1/admin/inventory",
    responses((status = 200, description = "Variants with product context")),
    tag = "inventory"
)]
pub async fn list_inventory(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<PaginatedResponse<InventoryRow>> {
    let (rows, total) = state
        .services
        .inventory
        .list(query.page, query.limit)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        rows,
        total,
        query.page,
        query.limit,
    ))))
}

/// PUT /admin/inventory
///
/// Sets a variant's stock to an absolute count and records the delta in the
/// ledger.
#[utoipa::path(
    put,
    path = "/api/v1/admin/inventory",
    request_body = SetStockInput,
    responses(
        (status = 200, description = "Stock updated"),
        (status = 400, description = "Negative count"),
        (status = 404, description = "Unknown variant"),
        (status = 409, description = "Lost too many races, try again")
    ),
    tag = "inventory"
)]
pub async fn set_stock(
    State(state): State<AppState>,
    Json(input): Json<SetStockInput>,
) -> ApiResult<variant::Model> {
    let updated = state
        .services
        .inventory
        .set_stock(
            input.variant_id,
            input.inventory_count,
            InventorySource::AdminPanel,
            "Admin manual adjustment",
        )
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}
