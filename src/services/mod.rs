pub mod catalog;
pub mod daraja;
pub mod inventory;
pub mod orders;
pub mod payments;
pub mod pos_sync;
