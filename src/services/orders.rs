use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::{
    inventory_log::InventorySource, order, order::OrderStatus, order_item, product, user, variant,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutItemInput {
    pub variant_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
    /// Client-declared unit price; rejected unless it matches
    /// `product.price + variant.price_delta` exactly.
    pub unit_price: Decimal,
}

/// Shipping address as a validated document; stored verbatim on the order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1))]
    pub full_name: String,
    #[validate(length(min = 1))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1))]
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[validate(length(min = 1))]
    pub country: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutInput {
    #[validate]
    pub items: Vec<CheckoutItemInput>,
    #[validate]
    pub shipping_address: ShippingAddress,
    /// Client-declared grand total; rejected unless it matches the
    /// server-side recomputation exactly.
    pub total: Decimal,
    /// Owning user for authenticated checkouts; guest checkouts omit it.
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderWithItems {
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<order_item::Model>,
}

/// Collapses repeated variant lines into one line per variant, preserving
/// first-seen order. Duplicate lines must agree on the declared unit price.
fn merge_lines(items: &[CheckoutItemInput]) -> Result<Vec<(Uuid, i32, Decimal)>, ServiceError> {
    let mut merged: Vec<(Uuid, i32, Decimal)> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|(id, _, _)| *id == item.variant_id) {
            Some((_, qty, price)) => {
                if *price != item.unit_price {
                    return Err(ServiceError::ValidationError(format!(
                        "Conflicting unit prices for variant {}",
                        item.variant_id
                    )));
                }
                *qty += item.quantity;
            }
            None => merged.push((item.variant_id, item.quantity, item.unit_price)),
        }
    }
    Ok(merged)
}

/// Cancels an order on the caller's connection, releasing the stock hold of
/// every line. The cancellation is claimed with a conditional UPDATE keyed on
/// the status the caller observed; `None` means another writer moved the order
/// first and nothing was released. Returns the updated order and its items so
/// the caller can publish events after its transaction commits.
pub(crate) async fn cancel_order_on<C: ConnectionTrait>(
    conn: &C,
    order_model: order::Model,
    source: InventorySource,
) -> Result<Option<(order::Model, Vec<order_item::Model>)>, ServiceError> {
    let now = Utc::now();
    let claimed = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order_model.id))
        .filter(order::Column::Status.eq(order_model.status))
        .exec(conn)
        .await?;
    if claimed.rows_affected == 0 {
        return Ok(None);
    }

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_model.id))
        .all(conn)
        .await?;

    for item in &items {
        inventory::release_stock(conn, item.variant_id, item.quantity, order_model.id, source)
            .await?;
    }

    let updated = order::Model {
        status: OrderStatus::Cancelled,
        updated_at: now,
        ..order_model
    };

    Ok(Some((updated, items)))
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates an order from a cart: validates the lines, recomputes the
    /// total from the catalog, reserves stock per line, and writes the order,
    /// its items, and the ledger entries in one transaction.
    #[instrument(skip(self, input), fields(lines = input.items.len()))]
    pub async fn checkout(&self, input: CheckoutInput) -> Result<OrderWithItems, ServiceError> {
        input.validate()?;
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }

        let lines = merge_lines(&input.items)?;
        let order_id = Uuid::new_v4();
        let shipping_address = serde_json::to_value(&input.shipping_address)
            .map_err(|e| ServiceError::InternalError(format!("address encoding: {}", e)))?;

        let txn = self.db.begin().await?;

        if let Some(user_id) = input.user_id {
            user::Entity::find_by_id(user_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))?;
        }

        let mut total = Decimal::ZERO;
        let mut item_rows = Vec::with_capacity(lines.len());
        for (variant_id, quantity, declared_unit) in &lines {
            let Some((variant_model, parent)) = variant::Entity::find_by_id(*variant_id)
                .find_also_related(product::Entity)
                .one(&txn)
                .await?
            else {
                return Err(ServiceError::NotFound(format!(
                    "Variant {} not found",
                    variant_id
                )));
            };
            let parent = parent.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "variant {} has no parent product",
                    variant_model.id
                ))
            })?;
            if !parent.is_active {
                return Err(ServiceError::ValidationError(format!(
                    "Product {} is not available",
                    parent.sku
                )));
            }

            let unit_price = parent.price + variant_model.price_delta;
            if *declared_unit != unit_price {
                return Err(ServiceError::ValidationError(format!(
                    "Declared unit price {} for {} does not match the current price {}",
                    declared_unit, variant_model.sku, unit_price
                )));
            }
            total += unit_price * Decimal::from(*quantity);

            inventory::reserve_stock(&txn, *variant_id, *quantity, order_id).await?;

            item_rows.push(order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(*variant_id),
                quantity: Set(*quantity),
                unit_price: Set(unit_price),
            });
        }

        if input.total != total {
            return Err(ServiceError::ValidationError(format!(
                "Declared total {} does not match computed total {}",
                input.total, total
            )));
        }

        let now = Utc::now();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            status: Set(OrderStatus::Pending),
            total: Set(total),
            shipping_address: Set(shipping_address),
            user_id: Set(input.user_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        order_item::Entity::insert_many(item_rows).exec(&txn).await?;

        txn.commit().await?;

        if let Err(e) = self.event_sender.send(Event::OrderCreated(order_id)).await {
            warn!(error = %e, "Failed to publish order created event");
        }
        for (variant_id, quantity, _) in &lines {
            if let Err(e) = self
                .event_sender
                .send(Event::StockReserved {
                    variant_id: *variant_id,
                    quantity: *quantity,
                    order_id,
                })
                .await
            {
                warn!(error = %e, "Failed to publish stock reserved event");
            }
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?;

        Ok(OrderWithItems {
            order: order_model,
            items,
        })
    }

    pub async fn get_order(&self, id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order_model = order::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(id))
            .all(self.db.as_ref())
            .await?;

        Ok(OrderWithItems {
            order: order_model,
            items,
        })
    }

    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        status: Option<OrderStatus>,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let mut query = order::Entity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query.paginate(self.db.as_ref(), per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// Moves an order along its lifecycle, enforcing the transition table.
    /// Setting the same status twice is a no-op.
    #[instrument(skip(self), fields(%id, ?next))]
    pub async fn update_status(
        &self,
        id: Uuid,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        if next == OrderStatus::Cancelled {
            return self.cancel_order(id, InventorySource::AdminPanel).await;
        }

        let order_model = order::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

        let old_status = order_model.status;
        if old_status == next {
            return Ok(order_model);
        }
        if !old_status.can_transition_to(next) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot transition order from {:?} to {:?}",
                old_status, next
            )));
        }

        let mut active: order::ActiveModel = order_model.into();
        active.status = Set(next);
        active.updated_at = Set(Utc::now());
        let updated = active.update(self.db.as_ref()).await?;

        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id: id,
                old_status,
                new_status: next,
            })
            .await
        {
            warn!(error = %e, "Failed to publish order status event");
        }

        Ok(updated)
    }

    /// Cancels an order and returns its stock holds to the shelf in one
    /// transaction. Already-cancelled orders are a no-op.
    #[instrument(skip(self), fields(%id, ?source))]
    pub async fn cancel_order(
        &self,
        id: Uuid,
        source: InventorySource,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order_model = order::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

        if order_model.status == OrderStatus::Cancelled {
            return Ok(order_model);
        }
        let old_status = order_model.status;
        if !old_status.can_transition_to(OrderStatus::Cancelled) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot cancel an order in status {:?}",
                old_status
            )));
        }

        let (updated, items) = cancel_order_on(&txn, order_model, source)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict(format!("Order {} changed concurrently, try again", id))
            })?;

        txn.commit().await?;

        if let Err(e) = self.event_sender.send(Event::OrderCancelled(id)).await {
            warn!(error = %e, "Failed to publish order cancelled event");
        }
        for item in &items {
            if let Err(e) = self
                .event_sender
                .send(Event::StockReleased {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    order_id: id,
                })
                .await
            {
                warn!(error = %e, "Failed to publish stock released event");
            }
        }

        Ok(updated)
    }
}
