mod common;

use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde_json::json;

use common::{body_json, TestApp};
use duka_api::entities::{inventory_log, inventory_log::InventorySource};
use duka_api::services::inventory;

#[tokio::test]
async fn set_stock_updates_count_and_appends_ledger() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("BAG-01", dec!(1200), 4).await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/admin/inventory",
            Some(json!({ "variant_id": variant.id, "inventory_count": 10 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let after = app.variant(variant.id).await;
    assert_eq!(after.inventory_count, 10);

    let log = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant.id))
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.change, 6);
    assert_eq!(log.source, InventorySource::AdminPanel);
    assert_eq!(log.reason, "Admin manual adjustment");
}

#[tokio::test]
async fn set_stock_to_same_count_writes_no_ledger_entry() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("BAG-02", dec!(800), 4).await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/admin/inventory",
            Some(json!({ "variant_id": variant.id, "inventory_count": 4 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let logs = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant.id))
        .all(app.state.db.as_ref())
        .await
        .unwrap();
    assert!(logs.is_empty());
}

#[tokio::test]
async fn set_stock_rejects_negative_count() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("BAG-03", dec!(800), 4).await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/admin/inventory",
            Some(json!({ "variant_id": variant.id, "inventory_count": -1 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.variant(variant.id).await.inventory_count, 4);
}

#[tokio::test]
async fn set_stock_rejects_unknown_variant() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/admin/inventory",
            Some(json!({ "variant_id": uuid::Uuid::new_v4(), "inventory_count": 3 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inventory_listing_joins_product_context() {
    let app = TestApp::new().await;
    app.seed_variant("SHOE-01", dec!(3500), 2).await;

    let response = app
        .request(Method::GET, "/api/v1/admin/inventory", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["sku"], "SHOE-01");
    assert_eq!(items[0]["inventory_count"], 2);
    assert_eq!(items[0]["product_title"], "Test Product SHOE-01");
}

#[tokio::test]
async fn ledger_reconstructs_live_count_after_mixed_traffic() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("COAT-01", dec!(100), 10).await;

    // Admin bump, a checkout, a failed-payment release and another admin cut.
    app.state
        .services
        .inventory
        .set_stock(variant.id, 12, InventorySource::AdminPanel, "Recount")
        .await
        .unwrap();

    let order = app
        .state
        .services
        .orders
        .checkout(duka_api::services::orders::CheckoutInput {
            items: vec![duka_api::services::orders::CheckoutItemInput {
                variant_id: variant.id,
                quantity: 3,
                unit_price: dec!(100),
            }],
            shipping_address: serde_json::from_value(json!({
                "full_name": "Jane Buyer",
                "line1": "1 Market St",
                "city": "Nairobi",
                "country": "KE"
            }))
            .unwrap(),
            total: dec!(300),
            user_id: None,
        })
        .await
        .unwrap();

    app.state
        .services
        .orders
        .cancel_order(order.order.id, InventorySource::GatewayCallback)
        .await
        .unwrap();

    app.state
        .services
        .inventory
        .set_stock(variant.id, 6, InventorySource::AdminPanel, "Shrinkage")
        .await
        .unwrap();

    let after = app.variant(variant.id).await;
    let sum = inventory::ledger_sum(app.state.db.as_ref(), variant.id)
        .await
        .unwrap();
    assert_eq!(after.inventory_count, 6);
    assert_eq!(after.inventory_count as i64, after.initial_count as i64 + sum);

    // Entries, in order: +2 recount, -3 checkout, +3 release, -6 shrinkage.
    let changes: Vec<i32> = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant.id))
        .order_by_asc(inventory_log::Column::CreatedAt)
        .all(app.state.db.as_ref())
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.change)
        .collect();
    assert_eq!(changes.iter().sum::<i32>(), -4);
    assert_eq!(changes.len(), 4);
}
