use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::product;
use crate::errors::ServiceError;
use crate::services::catalog::{
    CreateProductInput, ProductFilter, ProductWithVariants, UpdateProductInput,
};
use crate::{ApiResponse, ApiResult, AppState, PaginatedResponse};

#[derive(Debug, Deserialize)]
pub struct ProductListQuery {
    #[serde(default = "crate::default_page")]
    pub page: u64,
    #[serde(default = "crate::default_limit")]
    pub limit: u64,
    pub q: Option<String>,
    pub category: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// Admin consoles pass true to see deactivated products.
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /products
#[utoipa::path(
    get,
    path = "/api/v1/products",
    responses((status = 200, description = "Products page with variants")),
    tag = "products"
)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductListQuery>,
) -> ApiResult<PaginatedResponse<ProductWithVariants>> {
    let filter = ProductFilter {
        q: query.q,
        category: query.category,
        min_price: query.min_price,
        max_price: query.max_price,
        include_inactive: query.include_inactive,
    };

    let (items, total) = state
        .services
        .catalog
        .list_products(filter, query.page, query.limit)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        items,
        total,
        query.page,
        query.limit,
    ))))
}

#[derive(Debug, Deserialize)]
pub struct ProductGetQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /products/:id
#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    responses(
        (status = 200, description = "Product with variants"),
        (status = 404, description = "Unknown or inactive product")
    ),
    tag = "products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ProductGetQuery>,
) -> ApiResult<ProductWithVariants> {
    let item = state
        .services
        .catalog
        .get_product(id, query.include_inactive)
        .await?;
    Ok(Json(ApiResponse::success(item)))
}

/// POST /products
#[utoipa::path(
    post,
    path = "/api/v1/products",
    request_body = CreateProductInput,
    responses(
        (status = 201, description = "Product created"),
        (status = 400, description = "Invalid fields"),
        (status = 409, description = "Duplicate SKU")
    ),
    tag = "products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(input): Json<CreateProductInput>,
) -> Result<(StatusCode, Json<ApiResponse<ProductWithVariants>>), ServiceError> {
    let created = state.services.catalog.create_product(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

/// PUT /products/:id
#[utoipa::path(
    put,
    path = "/api/v1/products/{id}",
    request_body = UpdateProductInput,
    responses(
        (status = 200, description = "Product updated"),
        (status = 404, description = "Unknown product"),
        (status = 409, description = "Duplicate SKU")
    ),
    tag = "products"
)]
pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateProductInput>,
) -> ApiResult<product::Model> {
    let updated = state.services.catalog.update_product(id, input).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// DELETE /products/:id
#[utoipa::path(
    delete,
    path = "/api/v1/products/{id}",
    responses(
        (status = 204, description = "Product deleted"),
        (status = 404, description = "Unknown product"),
        (status = 409, description = "Product has order history")
    ),
    tag = "products"
)]
pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.services.catalog.delete_product(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
