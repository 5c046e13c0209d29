use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, JoinType, LoaderTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::{category, inventory_log, order_item, product, product_category, variant};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// SKU suffix and attributes of the variant created implicitly when a
/// product arrives without any.
const DEFAULT_VARIANT_SUFFIX: &str = "DEFAULT";

fn default_variant_attributes() -> serde_json::Value {
    serde_json::json!({ "size": "Standard" })
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateVariantInput {
    #[validate(length(min = 1))]
    pub sku: String,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
    #[serde(default)]
    pub price_delta: Decimal,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub inventory_count: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateProductInput {
    #[validate(length(min = 1))]
    pub sku: String,
    #[validate(length(min = 1))]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    #[serde(default)]
    pub list_price: Option<Decimal>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    #[validate]
    pub variants: Vec<CreateVariantInput>,
    /// Stock for the implicit default variant when no variants are given.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub initial_stock: i32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateProductInput {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub sku: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1))]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub list_price: Option<Decimal>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Storefront/admin listing filter. The storefront never sees inactive
/// products; the admin console opts in.
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub q: Option<String>,
    pub category: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub include_inactive: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProductWithVariants {
    #[schema(value_type = Object)]
    pub product: product::Model,
    #[schema(value_type = Vec<Object>)]
    pub variants: Vec<variant::Model>,
}

#[derive(Clone)]
pub struct ProductService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl ProductService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    pub async fn list_products(
        &self,
        filter: ProductFilter,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<ProductWithVariants>, u64), ServiceError> {
        let mut query = product::Entity::find();

        if !filter.include_inactive {
            query = query.filter(product::Column::IsActive.eq(true));
        }
        if let Some(q) = &filter.q {
            query = query.filter(
                Condition::any()
                    .add(product::Column::Title.contains(q))
                    .add(product::Column::Sku.contains(q))
                    .add(product::Column::Description.contains(q)),
            );
        }
        if let Some(slug) = &filter.category {
            query = query
                .join(JoinType::InnerJoin, product::Relation::ProductCategories.def())
                .join(JoinType::InnerJoin, product_category::Relation::Category.def())
                .filter(category::Column::Slug.eq(slug));
        }
        if let Some(min) = filter.min_price {
            query = query.filter(product::Column::Price.gte(min));
        }
        if let Some(max) = filter.max_price {
            query = query.filter(product::Column::Price.lte(max));
        }

        let paginator = query
            .order_by_asc(product::Column::Title)
            .paginate(self.db.as_ref(), per_page);
        let total = paginator.num_items().await?;
        let products = paginator.fetch_page(page.saturating_sub(1)).await?;

        let variants = products
            .load_many(variant::Entity, self.db.as_ref())
            .await?;

        let items = products
            .into_iter()
            .zip(variants)
            .map(|(product, variants)| ProductWithVariants { product, variants })
            .collect();

        Ok((items, total))
    }

    pub async fn get_product(
        &self,
        id: Uuid,
        include_inactive: bool,
    ) -> Result<ProductWithVariants, ServiceError> {
        let product_model = product::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .filter(|p| include_inactive || p.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let variants = variant::Entity::find()
            .filter(variant::Column::ProductId.eq(id))
            .order_by_asc(variant::Column::Sku)
            .all(self.db.as_ref())
            .await?;

        Ok(ProductWithVariants {
            product: product_model,
            variants,
        })
    }

    /// Creates a product and its variants in one transaction. A product
    /// without variants gets the implicit `{sku}-DEFAULT` variant carrying
    /// `initial_stock`.
    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<ProductWithVariants, ServiceError> {
        input.validate()?;
        if input.price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Price cannot be negative".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let duplicate = product::Entity::find()
            .filter(product::Column::Sku.eq(&input.sku))
            .one(&txn)
            .await?;
        if duplicate.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Product SKU {} already exists",
                input.sku
            )));
        }

        let now = Utc::now();
        let product_id = Uuid::new_v4();
        let product_model = product::ActiveModel {
            id: Set(product_id),
            sku: Set(input.sku.clone()),
            title: Set(input.title),
            description: Set(input.description),
            price: Set(input.price),
            list_price: Set(input.list_price),
            images: Set(serde_json::json!(input.images)),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let variant_inputs = if input.variants.is_empty() {
            vec![CreateVariantInput {
                sku: format!("{}-{}", input.sku, DEFAULT_VARIANT_SUFFIX),
                attributes: Some(default_variant_attributes()),
                price_delta: Decimal::ZERO,
                inventory_count: input.initial_stock,
            }]
        } else {
            input.variants
        };

        let mut variants = Vec::with_capacity(variant_inputs.len());
        for v in variant_inputs {
            let duplicate = variant::Entity::find()
                .filter(variant::Column::Sku.eq(&v.sku))
                .one(&txn)
                .await?;
            if duplicate.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "Variant SKU {} already exists",
                    v.sku
                )));
            }

            let model = variant::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(product_id),
                sku: Set(v.sku),
                attributes: Set(v.attributes.unwrap_or_else(|| serde_json::json!({}))),
                price_delta: Set(v.price_delta),
                inventory_count: Set(v.inventory_count),
                initial_count: Set(v.inventory_count),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
            variants.push(model);
        }

        txn.commit().await?;

        if let Err(e) = self.event_sender.send(Event::ProductCreated(product_id)).await {
            warn!(error = %e, "Failed to publish product created event");
        }

        Ok(ProductWithVariants {
            product: product_model,
            variants,
        })
    }

    #[instrument(skip(self, input), fields(%id))]
    pub async fn update_product(
        &self,
        id: Uuid,
        input: UpdateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        if matches!(input.price, Some(p) if p < Decimal::ZERO) {
            return Err(ServiceError::ValidationError(
                "Price cannot be negative".to_string(),
            ));
        }

        let product_model = product::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        if let Some(sku) = &input.sku {
            let duplicate = product::Entity::find()
                .filter(product::Column::Sku.eq(sku))
                .filter(product::Column::Id.ne(id))
                .one(self.db.as_ref())
                .await?;
            if duplicate.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "Product SKU {} already exists",
                    sku
                )));
            }
        }

        let mut active: product::ActiveModel = product_model.into();
        if let Some(sku) = input.sku {
            active.sku = Set(sku);
        }
        if let Some(title) = input.title {
            active.title = Set(title);
        }
        if let Some(description) = input.description {
            active.description = Set(Some(description));
        }
        if let Some(price) = input.price {
            active.price = Set(price);
        }
        if let Some(list_price) = input.list_price {
            active.list_price = Set(Some(list_price));
        }
        if let Some(images) = input.images {
            active.images = Set(serde_json::json!(images));
        }
        if let Some(is_active) = input.is_active {
            active.is_active = Set(is_active);
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(self.db.as_ref()).await?;

        if let Err(e) = self.event_sender.send(Event::ProductUpdated(id)).await {
            warn!(error = %e, "Failed to publish product updated event");
        }

        Ok(updated)
    }

    /// Deletes a product with its variants, ledger entries and category
    /// links. Products with order history cannot be deleted; deactivate them
    /// instead.
    #[instrument(skip(self), fields(%id))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let product_model = product::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let variant_ids: Vec<Uuid> = variant::Entity::find()
            .filter(variant::Column::ProductId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect();

        if !variant_ids.is_empty() {
            let referenced = order_item::Entity::find()
                .filter(order_item::Column::VariantId.is_in(variant_ids.clone()))
                .count(&txn)
                .await?;
            if referenced > 0 {
                return Err(ServiceError::Conflict(format!(
                    "Product {} has order history; deactivate it instead",
                    product_model.sku
                )));
            }

            inventory_log::Entity::delete_many()
                .filter(inventory_log::Column::VariantId.is_in(variant_ids))
                .exec(&txn)
                .await?;
            variant::Entity::delete_many()
                .filter(variant::Column::ProductId.eq(id))
                .exec(&txn)
                .await?;
        }

        product_category::Entity::delete_many()
            .filter(product_category::Column::ProductId.eq(id))
            .exec(&txn)
            .await?;
        product::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;

        if let Err(e) = self.event_sender.send(Event::ProductDeleted(id)).await {
            warn!(error = %e, "Failed to publish product deleted event");
        }

        Ok(())
    }
}
