use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::entities::{inventory_log::InventorySource, order::OrderStatus};

/// Domain events emitted by the services. Delivery is best-effort: a full or
/// closed channel is logged by the caller, never surfaced to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),

    // Payment events
    PaymentInitiated {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentSucceeded {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
    },

    // Inventory events
    StockReserved {
        variant_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    StockReleased {
        variant_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    StockAdjusted {
        variant_id: Uuid,
        change: i32,
        source: InventorySource,
    },

    // Catalog events
    ProductCreated(Uuid),
    ProductUpdated(Uuid),
    ProductDeleted(Uuid),

    // Sync events
    PosSyncCompleted {
        synced: usize,
        errors: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Consumes domain events and logs them. Runs until the channel closes.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(?event, "Processing domain event");
    }
    info!("Event channel closed; event processor stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .send(Event::OrderCreated(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Event::OrderCreated(_))));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::OrderCancelled(Uuid::new_v4()))
            .await
            .is_err());
    }
}
