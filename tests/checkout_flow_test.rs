mod common;

use std::str::FromStr;

use axum::http::{Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;

use common::{body_json, TestApp};
use duka_api::entities::{inventory_log, order};
use duka_api::services::inventory;

fn address() -> serde_json::Value {
    json!({
        "full_name": "Jane Buyer",
        "line1": "1 Market St",
        "city": "Nairobi",
        "country": "KE"
    })
}

#[tokio::test]
async fn checkout_creates_pending_order_and_reserves_stock() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("TEE-RED-M", dec!(500), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 2, "unit_price": "500" }],
                "shipping_address": address(),
                "total": "1000"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["data"]["order"]["status"], "PENDING");
    let total = Decimal::from_str(body["data"]["order"]["total"].as_str().unwrap()).unwrap();
    assert_eq!(total, dec!(1000));

    // The hold is a real decrement.
    let after = app.variant(variant.id).await;
    assert_eq!(after.inventory_count, 8);

    // One negative CHECKOUT ledger entry for the line.
    let logs = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant.id))
        .all(app.state.db.as_ref())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].change, -2);
    assert_eq!(
        logs[0].source,
        duka_api::entities::inventory_log::InventorySource::Checkout
    );

    // Ledger invariant: live count equals creation stock plus log sum.
    let sum = inventory::ledger_sum(app.state.db.as_ref(), variant.id)
        .await
        .unwrap();
    assert_eq!(after.inventory_count as i64, after.initial_count as i64 + sum);
}

#[tokio::test]
async fn checkout_rejects_insufficient_stock() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("TEE-BLUE-S", dec!(250), 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 2, "unit_price": "250" }],
                "shipping_address": address(),
                "total": "500"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("TEE-BLUE-S"));

    // Nothing written.
    let after = app.variant(variant.id).await;
    assert_eq!(after.inventory_count, 1);
    let orders = order::Entity::find().count(app.state.db.as_ref()).await.unwrap();
    assert_eq!(orders, 0);
}

#[tokio::test]
async fn checkout_rejects_unknown_variant() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": uuid::Uuid::new_v4(), "quantity": 1, "unit_price": "100" }],
                "shipping_address": address(),
                "total": "100"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checkout_rejects_empty_cart() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [],
                "shipping_address": address(),
                "total": "0"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkout_rejects_total_mismatch_and_rolls_back() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("MUG-01", dec!(750), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1, "unit_price": "750" }],
                "shipping_address": address(),
                "total": "1"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The reservation made before the total check must be rolled back.
    let after = app.variant(variant.id).await;
    assert_eq!(after.inventory_count, 5);
    let logs = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant.id))
        .count(app.state.db.as_ref())
        .await
        .unwrap();
    assert_eq!(logs, 0);
}

#[tokio::test]
async fn checkout_rejects_stale_line_price() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("MUG-02", dec!(500), 5).await;

    // Line price from an outdated cart; the declared total happens to match
    // the authoritative one, so only the per-line check can catch it.
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1, "unit_price": "450" }],
                "shipping_address": address(),
                "total": "500"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("unit price"));

    // Nothing written.
    assert_eq!(app.variant(variant.id).await.inventory_count, 5);
    let orders = order::Entity::find().count(app.state.db.as_ref()).await.unwrap();
    assert_eq!(orders, 0);
}

#[tokio::test]
async fn checkout_merges_duplicate_lines() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("CAP-01", dec!(300), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [
                    { "variant_id": variant.id, "quantity": 1, "unit_price": "300" },
                    { "variant_id": variant.id, "quantity": 2, "unit_price": "300" }
                ],
                "shipping_address": address(),
                "total": "900"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);

    let after = app.variant(variant.id).await;
    assert_eq!(after.inventory_count, 7);
}

#[tokio::test]
async fn multi_line_checkout_is_atomic() {
    let app = TestApp::new().await;
    let plenty = app.seed_variant("SOCK-01", dec!(100), 10).await;
    let scarce = app.seed_variant("SOCK-02", dec!(100), 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [
                    { "variant_id": plenty.id, "quantity": 2, "unit_price": "100" },
                    { "variant_id": scarce.id, "quantity": 5, "unit_price": "100" }
                ],
                "shipping_address": address(),
                "total": "700"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The first line's hold must not survive the failure of the second.
    assert_eq!(app.variant(plenty.id).await.inventory_count, 10);
    assert_eq!(app.variant(scarce.id).await.inventory_count, 1);
}

#[tokio::test]
async fn checkout_attaches_owning_user() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("TEE-OWNED", dec!(400), 2).await;

    let user_id = uuid::Uuid::new_v4();
    duka_api::entities::user::ActiveModel {
        id: sea_orm::Set(user_id),
        email: sea_orm::Set("jane@example.com".to_string()),
        name: sea_orm::Set("Jane Buyer".to_string()),
        phone: sea_orm::Set(None),
        role: sea_orm::Set(duka_api::entities::user::UserRole::Customer),
        created_at: sea_orm::Set(chrono::Utc::now()),
    }
    .insert(app.state.db.as_ref())
    .await
    .unwrap();

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1, "unit_price": "400" }],
                "shipping_address": address(),
                "total": "400",
                "user_id": user_id
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["data"]["order"]["user_id"], user_id.to_string());
}

#[tokio::test]
async fn checkout_rejects_unknown_user() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("TEE-ORPHAN", dec!(400), 2).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1, "unit_price": "400" }],
                "shipping_address": address(),
                "total": "400",
                "user_id": uuid::Uuid::new_v4()
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // No hold taken for the refused order.
    assert_eq!(app.variant(variant.id).await.inventory_count, 2);
}

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HAT-01", dec!(200), 3).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orders = app.state.services.orders.clone();
        let variant_id = variant.id;
        handles.push(tokio::spawn(async move {
            orders
                .checkout(duka_api::services::orders::CheckoutInput {
                    items: vec![duka_api::services::orders::CheckoutItemInput {
                        variant_id,
                        quantity: 1,
                        unit_price: dec!(200),
                    }],
                    shipping_address: serde_json::from_value(
                        json!({
                            "full_name": "Jane Buyer",
                            "line1": "1 Market St",
                            "city": "Nairobi",
                            "country": "KE"
                        }),
                    )
                    .unwrap(),
                    total: dec!(200),
                    user_id: None,
                })
                .await
        }));
    }

    let mut succeeded = 0;
    let mut out_of_stock = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(duka_api::errors::ServiceError::OutOfStock(_)) => out_of_stock += 1,
            Err(other) => panic!("unexpected checkout error: {other}"),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(out_of_stock, 5);
    assert_eq!(app.variant(variant.id).await.inventory_count, 0);
}
