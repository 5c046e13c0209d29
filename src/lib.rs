//! Duka API Library
//!
//! Storefront and admin backend: catalog, checkout, M-Pesa payments,
//! inventory ledger and POS sync.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, routing::post, routing::put, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use crate::handlers::AppServices;
use crate::services::catalog::ProductService;
use crate::services::inventory::InventoryService;
use crate::services::orders::OrderService;
use crate::services::payments::{PaymentGateway, PaymentService};
use crate::services::pos_sync::{CatalogSource, SyncService};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: AppServices,
}

impl AppState {
    /// Wires every service against one pool, gateway and catalog source.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        catalog_source: Arc<dyn CatalogSource>,
        event_sender: events::EventSender,
    ) -> Self {
        let inventory = InventoryService::new(db.clone(), event_sender.clone());
        let services = AppServices {
            orders: OrderService::new(db.clone(), event_sender.clone()),
            payments: PaymentService::new(db.clone(), gateway, event_sender.clone()),
            inventory: inventory.clone(),
            catalog: ProductService::new(db.clone(), event_sender.clone()),
            pos_sync: SyncService::new(db.clone(), catalog_source, inventory, event_sender.clone()),
        };
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

/// Common query parameters for list endpoints.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

pub(crate) fn default_page() -> u64 {
    1
}
pub(crate) fn default_limit() -> u64 {
    20
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, limit: u64) -> Self {
        let total_pages = if limit == 0 { 0 } else { total.div_ceil(limit) };
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(handlers::checkout::checkout))
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route(
            "/payments/daraja/initiate",
            post(handlers::payments::initiate_daraja_payment),
        )
        .route(
            "/payments/daraja/callback",
            post(handlers::payments::daraja_callback),
        )
        .route(
            "/products",
            get(handlers::products::list_products).post(handlers::products::create_product),
        )
        .route(
            "/products/:id",
            get(handlers::products::get_product)
                .put(handlers::products::update_product)
                .delete(handlers::products::delete_product),
        )
        .route(
            "/admin/inventory",
            get(handlers::inventory::list_inventory).put(handlers::inventory::set_stock),
        )
        .route("/pos/sync", post(handlers::pos::run_sync))
}

async fn status_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "database": if db_ok { "up" } else { "down" },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Full application router with middleware, docs and liveness routes.
pub fn app_router(state: AppState) -> Router {
    let cors = if state.config.is_development() {
        CorsLayer::permissive()
    } else {
        match &state.config.cors_allowed_origins {
            Some(origins) => {
                let origins: Vec<axum::http::HeaderValue> = origins
                    .split(',')
                    .filter_map(|o| o.trim().parse().ok())
                    .collect();
                CorsLayer::new().allow_origin(origins)
            }
            None => CorsLayer::new(),
        }
    };

    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
