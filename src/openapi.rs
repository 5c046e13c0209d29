use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Duka API",
        version = "0.1.0",
        description = r#"
# Duka Commerce API

Storefront and admin backend for a small shop: product catalog, checkout,
M-Pesa (Daraja STK push) payments, an audited inventory ledger and POS
catalog sync.

## Error handling

Every endpoint renders errors in one shape:

```json
{
  "error": "Bad Request",
  "message": "Insufficient stock for MUG-01",
  "timestamp": "2025-08-25T00:00:00Z"
}
```

## Pagination

List endpoints take `page` (default 1) and `limit` (default 20).
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "checkout", description = "Cart to order"),
        (name = "orders", description = "Order lifecycle"),
        (name = "payments", description = "Daraja STK push and notifications"),
        (name = "products", description = "Catalog reads and admin CRUD"),
        (name = "inventory", description = "Stock levels and adjustments"),
        (name = "pos", description = "POS catalog sync")
    ),
    paths(
        crate::handlers::checkout::checkout,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::cancel_order,
        crate::handlers::payments::initiate_daraja_payment,
        crate::handlers::payments::daraja_callback,
        crate::handlers::products::list_products,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::update_product,
        crate::handlers::products::delete_product,
        crate::handlers::inventory::list_inventory,
        crate::handlers::inventory::set_stock,
        crate::handlers::pos::run_sync,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::services::orders::CheckoutInput,
        crate::services::orders::CheckoutItemInput,
        crate::services::orders::ShippingAddress,
        crate::services::payments::InitiatePaymentInput,
        crate::services::catalog::CreateProductInput,
        crate::services::catalog::CreateVariantInput,
        crate::services::catalog::UpdateProductInput,
        crate::services::pos_sync::SyncReport,
        crate::handlers::inventory::SetStockInput,
        crate::handlers::orders::UpdateOrderStatusInput,
        crate::entities::order::OrderStatus,
    ))
)]
pub struct ApiDoc;

pub fn swagger_router() -> Router<AppState> {
    Router::new().merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
