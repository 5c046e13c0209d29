pub mod checkout;
pub mod inventory;
pub mod orders;
pub mod payments;
pub mod pos;
pub mod products;

use crate::services::catalog::ProductService;
use crate::services::inventory::InventoryService;
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::services::pos_sync::SyncService;

/// All domain services, wired once at startup and cloned into the state.
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub payments: PaymentService,
    pub inventory: InventoryService,
    pub catalog: ProductService,
    pub pos_sync: SyncService,
}
