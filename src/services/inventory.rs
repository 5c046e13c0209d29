use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{inventory_log, inventory_log::InventorySource, product, variant};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Attempts before giving up on a contended compare-and-swap stock write.
const SET_STOCK_RETRIES: u32 = 5;

/// Takes a hold on `quantity` units of a variant by decrementing its live
/// count, conditional on enough stock being available. Runs on the caller's
/// connection so it can participate in the order-creation transaction.
///
/// Zero rows affected means either the variant does not exist or the stock is
/// short; the two are distinguished with a follow-up read.
pub async fn reserve_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(
            "Quantity must be at least 1".to_string(),
        ));
    }

    let result = variant::Entity::update_many()
        .col_expr(
            variant::Column::InventoryCount,
            Expr::col(variant::Column::InventoryCount).sub(quantity),
        )
        .col_expr(variant::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(variant::Column::Id.eq(variant_id))
        .filter(variant::Column::InventoryCount.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return match variant::Entity::find_by_id(variant_id).one(conn).await? {
            Some(v) => Err(ServiceError::OutOfStock(v.sku)),
            None => Err(ServiceError::NotFound(format!(
                "Variant {} not found",
                variant_id
            ))),
        };
    }

    inventory_log::ActiveModel {
        id: Set(Uuid::new_v4()),
        variant_id: Set(variant_id),
        change: Set(-quantity),
        reason: Set(format!("Reserved for order {}", order_id)),
        source: Set(InventorySource::Checkout),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    Ok(())
}

/// Returns a previously reserved hold to the shelf. The increment is
/// unconditional; the matching positive ledger entry keeps the invariant.
pub async fn release_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
    order_id: Uuid,
    source: InventorySource,
) -> Result<(), ServiceError> {
    let result = variant::Entity::update_many()
        .col_expr(
            variant::Column::InventoryCount,
            Expr::col(variant::Column::InventoryCount).add(quantity),
        )
        .col_expr(variant::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(variant::Column::Id.eq(variant_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!(
            "Variant {} not found",
            variant_id
        )));
    }

    inventory_log::ActiveModel {
        id: Set(Uuid::new_v4()),
        variant_id: Set(variant_id),
        change: Set(quantity),
        reason: Set(format!("Released hold for order {}", order_id)),
        source: Set(source),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    Ok(())
}

/// Signed sum of all ledger entries for a variant. Together with
/// `initial_count` this reconstructs the live count.
pub async fn ledger_sum<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
) -> Result<i64, ServiceError> {
    let sum: Option<Option<i64>> = inventory_log::Entity::find()
        .filter(inventory_log::Column::VariantId.eq(variant_id))
        .select_only()
        .column_as(Expr::col(inventory_log::Column::Change).sum(), "total_change")
        .into_tuple()
        .one(conn)
        .await?;

    Ok(sum.flatten().unwrap_or(0))
}

/// One row of the admin inventory listing: a variant with enough of its
/// parent product to be readable on its own.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InventoryRow {
    pub variant_id: Uuid,
    pub sku: String,
    pub attributes: serde_json::Value,
    pub inventory_count: i32,
    pub product_id: Uuid,
    pub product_title: String,
    /// Effective unit price (product price + variant delta).
    pub price: Decimal,
}

#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Sets a variant's stock to an absolute count via an optimistic
    /// compare-and-swap, appending the ledger entry for the delta in the same
    /// transaction. Retries a bounded number of times under contention.
    #[instrument(skip(self), fields(%variant_id, new_count))]
    pub async fn set_stock(
        &self,
        variant_id: Uuid,
        new_count: i32,
        source: InventorySource,
        reason: &str,
    ) -> Result<variant::Model, ServiceError> {
        if new_count < 0 {
            return Err(ServiceError::ValidationError(
                "Inventory count cannot be negative".to_string(),
            ));
        }

        for _ in 0..SET_STOCK_RETRIES {
            let current = variant::Entity::find_by_id(variant_id)
                .one(self.db.as_ref())
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Variant {} not found", variant_id))
                })?;

            let change = new_count - current.inventory_count;
            if change == 0 {
                return Ok(current);
            }

            let txn = self.db.begin().await?;

            let result = variant::Entity::update_many()
                .col_expr(variant::Column::InventoryCount, Expr::value(new_count))
                .col_expr(variant::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(variant::Column::Id.eq(variant_id))
                .filter(variant::Column::InventoryCount.eq(current.inventory_count))
                .exec(&txn)
                .await?;

            if result.rows_affected == 0 {
                // Lost the race; re-read and try again.
                txn.rollback().await?;
                continue;
            }

            inventory_log::ActiveModel {
                id: Set(Uuid::new_v4()),
                variant_id: Set(variant_id),
                change: Set(change),
                reason: Set(reason.to_string()),
                source: Set(source),
                created_at: Set(Utc::now()),
            }
            .insert(&txn)
            .await?;

            txn.commit().await?;

            if let Err(e) = self
                .event_sender
                .send(Event::StockAdjusted {
                    variant_id,
                    change,
                    source,
                })
                .await
            {
                warn!(error = %e, "Failed to publish stock adjustment event");
            }

            return Ok(variant::Model {
                inventory_count: new_count,
                updated_at: Utc::now(),
                ..current
            });
        }

        Err(ServiceError::Conflict(format!(
            "Variant {} is under concurrent modification, try again",
            variant_id
        )))
    }

    /// Admin inventory listing: every variant joined with its parent product.
    pub async fn list(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<InventoryRow>, u64), ServiceError> {
        let paginator = variant::Entity::find()
            .find_also_related(product::Entity)
            .order_by_asc(variant::Column::Sku)
            .paginate(self.db.as_ref(), per_page);

        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page.saturating_sub(1)).await?;

        let rows = rows
            .into_iter()
            .map(|(v, p)| {
                let (product_id, product_title, base_price) = match p {
                    Some(p) => (p.id, p.title, p.price),
                    None => (v.product_id, String::new(), Decimal::ZERO),
                };
                InventoryRow {
                    variant_id: v.id,
                    sku: v.sku,
                    attributes: v.attributes,
                    inventory_count: v.inventory_count,
                    product_id,
                    product_title,
                    price: base_price + v.price_delta,
                }
            })
            .collect();

        Ok((rows, total))
    }
}
