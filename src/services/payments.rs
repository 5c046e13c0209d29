use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::{
    inventory_log::InventorySource, order, order::OrderStatus, payment, payment::PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::orders;

/// Outbound charge request, gateway-neutral.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub phone_number: String,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ChargeResponse {
    /// Provider id the later notification will be keyed by.
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub description: String,
}

/// Seam between the payment flow and a concrete provider. Flow tests
/// substitute a scripted double here.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;
    async fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ServiceError>;
}

/// Inbound notification after provider field names have been stripped away.
#[derive(Debug, Clone)]
pub struct PaymentNotification {
    pub external_txn_id: String,
    pub success: bool,
    /// Provider receipt number, when the charge went through.
    pub receipt: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct InitiatePaymentInput {
    pub order_id: Uuid,
    #[validate(length(min = 9, message = "phone number is too short"))]
    pub phone_number: String,
    /// Client-declared amount; must equal the order total.
    pub amount: Decimal,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(db: Arc<DbPool>, gateway: Arc<dyn PaymentGateway>, event_sender: EventSender) -> Self {
        Self {
            db,
            gateway,
            event_sender,
        }
    }

    /// Starts a charge for a pending order. The payment row is written with
    /// the provider's checkout-request id before this returns, so the
    /// notification handler can always find it.
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn initiate(
        &self,
        input: InitiatePaymentInput,
    ) -> Result<payment::Model, ServiceError> {
        input.validate()?;

        let order_model = order::Entity::find_by_id(input.order_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", input.order_id)))?;

        if order_model.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Payment can only be initiated for a pending order (status is {:?})",
                order_model.status
            )));
        }

        let already_paid = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_model.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Success))
            .one(self.db.as_ref())
            .await?;
        if already_paid.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already paid",
                order_model.id
            )));
        }

        if input.amount != order_model.total {
            return Err(ServiceError::ValidationError(format!(
                "Declared amount {} does not match order total {}",
                input.amount, order_model.total
            )));
        }

        let response = self
            .gateway
            .initiate_charge(&ChargeRequest {
                amount: order_model.total,
                phone_number: input.phone_number.clone(),
                account_reference: order_model.id.to_string(),
                description: "Order payment".to_string(),
            })
            .await?;

        let now = Utc::now();
        let payment_model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_model.id),
            gateway: Set(self.gateway.name().to_string()),
            status: Set(PaymentStatus::Pending),
            amount: Set(order_model.total),
            external_txn_id: Set(Some(response.checkout_request_id)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        if let Err(e) = self
            .event_sender
            .send(Event::PaymentInitiated {
                payment_id: payment_model.id,
                order_id: order_model.id,
            })
            .await
        {
            warn!(error = %e, "Failed to publish payment initiated event");
        }

        Ok(payment_model)
    }

    /// Reconciles an inbound gateway notification with the order and its
    /// stock holds. Idempotent: terminal payments and unknown ids no-op, so
    /// at-least-once delivery is safe.
    #[instrument(skip(self, notification), fields(external_txn_id = %notification.external_txn_id, success = notification.success))]
    pub async fn handle_notification(
        &self,
        notification: PaymentNotification,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let txn = self.db.begin().await?;

        let Some(payment_model) = payment::Entity::find()
            .filter(payment::Column::ExternalTxnId.eq(notification.external_txn_id.as_str()))
            .one(&txn)
            .await?
        else {
            warn!(
                external_txn_id = %notification.external_txn_id,
                "Notification for unknown checkout request, ignoring"
            );
            return Ok(None);
        };

        // Fast path for replays; the conditional UPDATE in mark_payment is
        // what actually serializes concurrent deliveries.
        if payment_model.status.is_terminal() {
            info!(payment_id = %payment_model.id, "Replayed notification for settled payment, ignoring");
            return Ok(Some(payment_model));
        }

        let order_model = order::Entity::find_by_id(payment_model.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "payment {} references missing order {}",
                    payment_model.id, payment_model.order_id
                ))
            })?;

        let payment_id = payment_model.id;
        let order_id = order_model.id;
        let mut events = Vec::new();
        let updated;

        if notification.success {
            if order_model.status == OrderStatus::Cancelled {
                // Funds arrived for a dead order. Reject the payment and keep
                // inventory untouched; settlement is reconciled out of band.
                warn!(%order_id, "Successful charge against a cancelled order, marking payment failed");
                let Some(settled) =
                    mark_payment(&txn, payment_model, PaymentStatus::Failed, None).await?
                else {
                    info!(%payment_id, "Payment settled by a concurrent delivery, ignoring");
                    return Ok(None);
                };
                updated = settled;
                events.push(Event::PaymentFailed {
                    payment_id,
                    order_id,
                });
            } else {
                let Some(settled) = mark_payment(
                    &txn,
                    payment_model,
                    PaymentStatus::Success,
                    notification.receipt.clone(),
                )
                .await?
                else {
                    info!(%payment_id, "Payment settled by a concurrent delivery, ignoring");
                    return Ok(None);
                };
                updated = settled;
                events.push(Event::PaymentSucceeded {
                    payment_id,
                    order_id,
                });

                // Stock was already decremented at reservation time; the
                // promotion is conditional so a concurrent cancel wins cleanly.
                let promoted = order::Entity::update_many()
                    .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
                    .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(order::Column::Id.eq(order_id))
                    .filter(order::Column::Status.eq(OrderStatus::Pending))
                    .exec(&txn)
                    .await?;
                if promoted.rows_affected > 0 {
                    events.push(Event::OrderStatusChanged {
                        order_id,
                        old_status: OrderStatus::Pending,
                        new_status: OrderStatus::Processing,
                    });
                }
            }
        } else {
            let Some(settled) =
                mark_payment(&txn, payment_model, PaymentStatus::Failed, None).await?
            else {
                info!(%payment_id, "Payment settled by a concurrent delivery, ignoring");
                return Ok(None);
            };
            updated = settled;
            events.push(Event::PaymentFailed {
                payment_id,
                order_id,
            });

            if order_model.status == OrderStatus::Pending {
                // The claim inside cancel_order_on is conditional too; if
                // another writer already moved the order, nothing is released.
                if let Some((_, items)) =
                    orders::cancel_order_on(&txn, order_model, InventorySource::GatewayCallback)
                        .await?
                {
                    events.push(Event::OrderCancelled(order_id));
                    for item in &items {
                        events.push(Event::StockReleased {
                            variant_id: item.variant_id,
                            quantity: item.quantity,
                            order_id,
                        });
                    }
                }
            }
        }

        txn.commit().await?;

        for event in events {
            if let Err(e) = self.event_sender.send(event).await {
                warn!(error = %e, "Failed to publish payment reconciliation event");
            }
        }

        Ok(Some(updated))
    }
}

/// Settles a payment with a conditional UPDATE that only fires while the row
/// is still PENDING. `None` means a concurrent delivery settled it first, and
/// the caller must treat the notification as a replay.
async fn mark_payment<C: ConnectionTrait>(
    conn: &C,
    payment_model: payment::Model,
    status: PaymentStatus,
    receipt: Option<String>,
) -> Result<Option<payment::Model>, ServiceError> {
    let now = Utc::now();
    let mut update = payment::Entity::update_many()
        .col_expr(payment::Column::Status, Expr::value(status))
        .col_expr(payment::Column::UpdatedAt, Expr::value(now))
        .filter(payment::Column::Id.eq(payment_model.id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending));
    if let Some(receipt) = receipt.clone() {
        // The receipt number supersedes the checkout-request id.
        update = update.col_expr(payment::Column::ExternalTxnId, Expr::value(Some(receipt)));
    }

    let settled = update.exec(conn).await?;
    if settled.rows_affected == 0 {
        return Ok(None);
    }

    let external_txn_id = receipt.or_else(|| payment_model.external_txn_id.clone());
    Ok(Some(payment::Model {
        status,
        external_txn_id,
        updated_at: now,
        ..payment_model
    }))
}
