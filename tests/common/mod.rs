use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use rust_decimal::Decimal;
use sea_orm::EntityTrait;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use duka_api::config::AppConfig;
use duka_api::entities::variant;
use duka_api::errors::ServiceError;
use duka_api::events::{self, EventSender};
use duka_api::services::catalog::{CreateProductInput, CreateVariantInput};
use duka_api::services::payments::{ChargeRequest, ChargeResponse, PaymentGateway};
use duka_api::services::pos_sync::{CatalogSource, PosItem, PosPage};
use duka_api::{app_router, db, AppState};

/// Scripted stand-in for the Daraja gateway. Records every charge request
/// and hands out sequential checkout-request ids, or fails on demand.
#[derive(Default)]
pub struct MockGateway {
    pub requests: Mutex<Vec<ChargeRequest>>,
    pub fail_next: Mutex<bool>,
    counter: Mutex<u32>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[allow(dead_code)]
    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    #[allow(dead_code)]
    pub fn last_request(&self) -> Option<ChargeRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "daraja"
    }

    async fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(ServiceError::UpstreamError(
                "Payment initiation failed".to_string(),
            ));
        }
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        Ok(ChargeResponse {
            checkout_request_id: format!("ws_CO_test_{}", counter),
            merchant_request_id: format!("merchant_{}", counter),
            description: "Success. Request accepted for processing".to_string(),
        })
    }
}

/// One-page catalog feed for sync tests.
#[derive(Default)]
pub struct StaticCatalogSource {
    pub items: Mutex<Vec<PosItem>>,
}

impl StaticCatalogSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[allow(dead_code)]
    pub fn set_items(&self, items: Vec<PosItem>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn fetch_page(&self, _cursor: Option<&str>) -> Result<PosPage, ServiceError> {
        Ok(PosPage {
            items: self.items.lock().unwrap().clone(),
            cursor: None,
        })
    }
}

/// Application harness backed by a throwaway SQLite file. A single pooled
/// connection keeps every request on the same database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub catalog_source: Arc<StaticCatalogSource>,
    db_file: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db_file = format!("duka_test_{}.db", Uuid::new_v4().simple());
        let _ = std::fs::remove_file(&db_file);

        let mut cfg = AppConfig::new(
            format!("sqlite://{db_file}?mode=rwc"),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.pos.sync_api_key = Some("test-sync-key".to_string());

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = MockGateway::new();
        let catalog_source = StaticCatalogSource::new();

        let state = AppState::new(
            db_arc,
            cfg,
            gateway.clone(),
            catalog_source.clone(),
            event_sender,
        );
        let router = app_router(state.clone());

        Self {
            router,
            state,
            gateway,
            catalog_source,
            db_file,
            _event_task: event_task,
        }
    }

    /// Send a JSON request against the router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Seeds one product with one variant and returns the variant.
    pub async fn seed_variant(&self, sku: &str, price: Decimal, stock: i32) -> variant::Model {
        let created = self
            .state
            .services
            .catalog
            .create_product(CreateProductInput {
                sku: format!("P-{}", sku),
                title: format!("Test Product {}", sku),
                description: Some("Seeded for integration tests".to_string()),
                price,
                list_price: None,
                images: vec![],
                is_active: true,
                variants: vec![CreateVariantInput {
                    sku: sku.to_string(),
                    attributes: Some(serde_json::json!({ "size": "M" })),
                    price_delta: Decimal::ZERO,
                    inventory_count: stock,
                }],
                initial_stock: 0,
            })
            .await
            .expect("seed product for tests");

        created.variants.into_iter().next().expect("seeded variant")
    }

    /// Re-reads a variant straight from the database.
    pub async fn variant(&self, id: Uuid) -> variant::Model {
        variant::Entity::find_by_id(id)
            .one(self.state.db.as_ref())
            .await
            .expect("variant query")
            .expect("variant exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        let _ = std::fs::remove_file(&self.db_file);
    }
}

/// Reads a response body as JSON.
pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}
