use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Purchasable configuration of a product with its own stock count.
///
/// `initial_count` is the stock at creation time; the ledger invariant is
/// `inventory_count == initial_count + sum(inventory_logs.change)`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(unique)]
    pub sku: String,
    /// Free-form attribute bag (size, color, store id for POS variants).
    #[sea_orm(column_type = "Json")]
    pub attributes: Json,
    /// Added to the parent product price to form the effective unit price.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub price_delta: Decimal,
    pub inventory_count: i32,
    pub initial_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::inventory_log::Entity")]
    InventoryLogs,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::inventory_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
