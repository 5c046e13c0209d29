use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::PosConfig;
use crate::db::DbPool;
use crate::entities::{inventory_log::InventorySource, product, variant};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::InventoryService;

/// Stock and price of one item at one POS store.
#[derive(Debug, Clone)]
pub struct PosStoreStock {
    pub store_id: String,
    /// Store-specific price; `None` means the base price applies.
    pub price: Option<Decimal>,
    pub in_stock: i32,
}

/// One sellable item as reported by the POS.
#[derive(Debug, Clone)]
pub struct PosItem {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub base_price: Decimal,
    pub stores: Vec<PosStoreStock>,
}

#[derive(Debug, Clone, Default)]
pub struct PosPage {
    pub items: Vec<PosItem>,
    /// Opaque continuation token; `None` on the last page.
    pub cursor: Option<String>,
}

/// External catalog feed, paginated. The Loyverse client implements this;
/// tests substitute a static source.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<PosPage, ServiceError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct SyncReport {
    pub synced: usize,
    pub errors: usize,
}

/// Pulls the POS catalog and reconciles it into products, per-store variants
/// and stock counts.
#[derive(Clone)]
pub struct SyncService {
    db: Arc<DbPool>,
    source: Arc<dyn CatalogSource>,
    inventory: InventoryService,
    event_sender: EventSender,
}

impl SyncService {
    pub fn new(
        db: Arc<DbPool>,
        source: Arc<dyn CatalogSource>,
        inventory: InventoryService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            source,
            inventory,
            event_sender,
        }
    }

    /// Walks the full feed. A failing item is logged and counted, never
    /// aborts the run; a failing page fetch does.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<SyncReport, ServiceError> {
        let mut report = SyncReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.source.fetch_page(cursor.as_deref()).await?;
            for item in &page.items {
                match self.sync_item(item).await {
                    Ok(()) => report.synced += 1,
                    Err(e) => {
                        warn!(sku = %item.sku, error = %e, "Failed to sync catalog item");
                        report.errors += 1;
                    }
                }
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(synced = report.synced, errors = report.errors, "POS sync finished");
        if let Err(e) = self
            .event_sender
            .send(Event::PosSyncCompleted {
                synced: report.synced,
                errors: report.errors,
            })
            .await
        {
            warn!(error = %e, "Failed to publish sync completed event");
        }

        Ok(report)
    }

    /// Upserts the product by SKU, one variant per store (`{sku}-{store_id}`)
    /// and the stock count through the audited adjustment path.
    async fn sync_item(&self, item: &PosItem) -> Result<(), ServiceError> {
        let product_model = self.upsert_product(item).await?;

        if item.stores.is_empty() {
            // No store data: just make sure the product is sellable at all.
            self.ensure_variant(
                &product_model,
                &format!("{}-DEFAULT", item.sku),
                serde_json::json!({ "size": "Standard" }),
                Decimal::ZERO,
            )
            .await?;
            return Ok(());
        }

        for store in &item.stores {
            let price_delta = store
                .price
                .map(|p| p - item.base_price)
                .unwrap_or(Decimal::ZERO);
            let variant_model = self
                .ensure_variant(
                    &product_model,
                    &format!("{}-{}", item.sku, store.store_id),
                    serde_json::json!({ "store_id": store.store_id }),
                    price_delta,
                )
                .await?;

            let target = if store.in_stock < 0 {
                warn!(sku = %variant_model.sku, in_stock = store.in_stock, "POS reported negative stock, clamping to zero");
                0
            } else {
                store.in_stock
            };
            self.inventory
                .set_stock(variant_model.id, target, InventorySource::PosSync, "POS sync")
                .await?;
        }

        Ok(())
    }

    async fn upsert_product(&self, item: &PosItem) -> Result<product::Model, ServiceError> {
        let existing = product::Entity::find()
            .filter(product::Column::Sku.eq(&item.sku))
            .one(self.db.as_ref())
            .await?;

        match existing {
            Some(found) => {
                let unchanged = found.title == item.name
                    && found.price == item.base_price
                    && found.description == item.description;
                if unchanged {
                    return Ok(found);
                }
                let mut active: product::ActiveModel = found.into();
                active.title = Set(item.name.clone());
                active.description = Set(item.description.clone());
                active.price = Set(item.base_price);
                active.updated_at = Set(Utc::now());
                Ok(active.update(self.db.as_ref()).await?)
            }
            None => {
                let now = Utc::now();
                Ok(product::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    sku: Set(item.sku.clone()),
                    title: Set(item.name.clone()),
                    description: Set(item.description.clone()),
                    price: Set(item.base_price),
                    list_price: Set(None),
                    images: Set(serde_json::json!([])),
                    is_active: Set(true),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?)
            }
        }
    }

    async fn ensure_variant(
        &self,
        parent: &product::Model,
        sku: &str,
        attributes: serde_json::Value,
        price_delta: Decimal,
    ) -> Result<variant::Model, ServiceError> {
        let existing = variant::Entity::find()
            .filter(variant::Column::Sku.eq(sku))
            .one(self.db.as_ref())
            .await?;

        match existing {
            Some(found) => {
                if found.product_id != parent.id {
                    return Err(ServiceError::Conflict(format!(
                        "Variant SKU {} belongs to another product",
                        sku
                    )));
                }
                if found.price_delta != price_delta {
                    let mut active: variant::ActiveModel = found.clone().into();
                    active.price_delta = Set(price_delta);
                    active.updated_at = Set(Utc::now());
                    return Ok(active.update(self.db.as_ref()).await?);
                }
                Ok(found)
            }
            None => {
                let now = Utc::now();
                Ok(variant::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(parent.id),
                    sku: Set(sku.to_string()),
                    attributes: Set(attributes),
                    price_delta: Set(price_delta),
                    inventory_count: Set(0),
                    initial_count: Set(0),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?)
            }
        }
    }
}

/// Loyverse-backed catalog feed: cursor-paginated `/items` joined with
/// `/inventory` stock levels.
pub struct LoyverseCatalog {
    config: PosConfig,
    client: reqwest::Client,
}

impl LoyverseCatalog {
    pub fn new(config: PosConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn token(&self) -> Result<&str, ServiceError> {
        self.config.api_token.as_deref().ok_or_else(|| {
            ServiceError::InvalidOperation("POS sync is not configured".to_string())
        })
    }

    async fn fetch_inventory(
        &self,
        token: &str,
        variant_ids: &[String],
    ) -> Result<Vec<LoyverseInventoryLevel>, ServiceError> {
        if variant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/inventory", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("variant_ids", variant_ids.join(","))])
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("POS inventory fetch: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::UpstreamError(format!(
                "POS inventory fetch returned {}",
                response.status()
            )));
        }

        let body: LoyverseInventoryResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("POS inventory decode: {}", e)))?;
        Ok(body.inventory_levels)
    }
}

#[async_trait]
impl CatalogSource for LoyverseCatalog {
    #[instrument(skip(self))]
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<PosPage, ServiceError> {
        let token = self.token()?.to_string();

        let url = format!("{}/items", self.config.base_url);
        let mut request = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("limit", self.config.page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("POS items fetch: {}", e)))?;
        if !response.status().is_success() {
            return Err(ServiceError::UpstreamError(format!(
                "POS items fetch returned {}",
                response.status()
            )));
        }

        let body: LoyverseItemsResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("POS items decode: {}", e)))?;

        let variant_ids: Vec<String> = body
            .items
            .iter()
            .flat_map(|item| item.variants.iter().map(|v| v.variant_id.clone()))
            .collect();
        let levels = self.fetch_inventory(&token, &variant_ids).await?;

        let mut items = Vec::new();
        for item in body.items {
            for v in item.variants {
                if v.sku.is_empty() {
                    warn!(item = %item.item_name, "POS variant without SKU, skipping");
                    continue;
                }
                let stores = v
                    .stores
                    .iter()
                    .map(|s| PosStoreStock {
                        store_id: s.store_id.clone(),
                        price: s.price,
                        in_stock: levels
                            .iter()
                            .find(|l| l.variant_id == v.variant_id && l.store_id == s.store_id)
                            .map(|l| l.in_stock as i32)
                            .unwrap_or(0),
                    })
                    .collect();
                items.push(PosItem {
                    sku: v.sku,
                    name: item.item_name.clone(),
                    description: item.description.clone(),
                    base_price: v.default_price.unwrap_or(Decimal::ZERO),
                    stores,
                });
            }
        }

        Ok(PosPage {
            items,
            cursor: body.cursor,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LoyverseItemsResponse {
    #[serde(default)]
    items: Vec<LoyverseItem>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoyverseItem {
    item_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    variants: Vec<LoyverseVariant>,
}

#[derive(Debug, Deserialize)]
struct LoyverseVariant {
    variant_id: String,
    #[serde(default)]
    sku: String,
    #[serde(default)]
    default_price: Option<Decimal>,
    #[serde(default)]
    stores: Vec<LoyverseStore>,
}

#[derive(Debug, Deserialize)]
struct LoyverseStore {
    store_id: String,
    #[serde(default)]
    price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LoyverseInventoryResponse {
    #[serde(default)]
    inventory_levels: Vec<LoyverseInventoryLevel>,
}

#[derive(Debug, Deserialize)]
struct LoyverseInventoryLevel {
    variant_id: String,
    store_id: String,
    #[serde(default)]
    in_stock: f64,
}
