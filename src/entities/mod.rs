pub mod category;
pub mod inventory_log;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod product_category;
pub mod user;
pub mod variant;
