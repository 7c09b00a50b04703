//! Payment state machine.
//!
//! Every change of an order's payment status goes through this module,
//! whichever entry point triggered it (webhook, provider poll, admin action,
//! simulation). Each transition holds the order's lock, re-reads the order
//! inside one transaction and applies status, stock and revenue together.

use crate::{
    db::{self, DbPool},
    entities::{
        order::{self, Entity as OrderEntity},
        FulfillmentStatus, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        inventory::InventoryLedger,
        order_locks::OrderLocks,
        payment_provider::{ExternalPaymentStatus, PaymentProvider},
        revenue::RevenueRecorder,
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, DatabaseTransaction, EntityTrait, IntoActiveModel, Set};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Instant};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Who asked for a transition. Used for logs and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Webhook,
    Poll,
    Admin,
    Simulation,
    Customer,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::Admin => "admin",
            Self::Simulation => "simulation",
            Self::Customer => "customer",
        }
    }
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The requested state was written.
    Applied,
    /// The order was already in a state that makes the request a no-op.
    AlreadyProcessed,
}

/// Final order snapshot after a transition attempt.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub order: order::Model,
    pub outcome: TransitionOutcome,
    pub inventory_mutated: bool,
}

impl TransitionResult {
    pub fn already_processed(&self) -> bool {
        self.outcome == TransitionOutcome::AlreadyProcessed
    }

    fn unchanged(order: order::Model) -> Self {
        Self {
            order,
            outcome: TransitionOutcome::AlreadyProcessed,
            inventory_mutated: false,
        }
    }
}

/// PIX payment attached to an order.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    pub payment_id: String,
    pub qr_code: Option<String>,
    pub qr_code_base64: Option<String>,
    /// The provider was called by this request.
    pub created: bool,
}

impl PaymentRequest {
    fn from_order(order: &order::Model, created: bool) -> Option<Self> {
        order.payment_id.as_ref().map(|payment_id| Self {
            order_id: order.id,
            payment_id: payment_id.clone(),
            qr_code: order.pix_qr_code.clone(),
            qr_code_base64: order.pix_qr_code_base64.clone(),
            created,
        })
    }
}

/// Events to publish once the transition has committed.
type PendingEvents = Vec<Event>;

#[derive(Clone)]
pub struct PaymentStateMachine {
    db_pool: Arc<DbPool>,
    locks: OrderLocks,
    provider: Arc<dyn PaymentProvider>,
    event_sender: Arc<EventSender>,
}

impl PaymentStateMachine {
    pub fn new(
        db_pool: Arc<DbPool>,
        locks: OrderLocks,
        provider: Arc<dyn PaymentProvider>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            locks,
            provider,
            event_sender,
        }
    }

    pub fn locks(&self) -> &OrderLocks {
        &self.locks
    }

    async fn publish(&self, events: PendingEvents) {
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
    }

    async fn load_locked(
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        db::lock_row_for_update(txn, "orders", order_id).await?;
        OrderEntity::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::order_not_found(order_id))
    }

    /// Creates the PIX payment for an order, once.
    ///
    /// An order that already has a payment id gets it back without a
    /// provider call. The provider is called without holding the order lock;
    /// the id is then stored under the lock only if still unset.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn request_payment(&self, order_id: Uuid) -> Result<PaymentRequest, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::order_not_found(order_id))?;

        if let Some(existing) = PaymentRequest::from_order(&order, false) {
            return Ok(existing);
        }
        if order.payment_status != PaymentStatus::Pending
            || order.status == FulfillmentStatus::Cancelled
        {
            return Err(ServiceError::InvalidTransition(format!(
                "Cannot request payment for an order with payment status {}",
                order.payment_status
            )));
        }

        let payment = self
            .provider
            .create_payment(order.total, format!("Pedido {}", order.id))
            .await?;

        let _guard = self.locks.acquire(order_id).await;
        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;

        let current = match Self::load_locked(&txn, order_id).await {
            Ok(current) => current,
            Err(e) => {
                db::rollback(txn).await;
                return Err(e);
            }
        };

        if let Some(winner) = PaymentRequest::from_order(&current, false) {
            db::rollback(txn).await;
            warn!(
                discarded_payment_id = %payment.id,
                payment_id = %winner.payment_id,
                "Concurrent payment request won, discarding provider payment"
            );
            return Ok(winner);
        }
        if current.payment_status != PaymentStatus::Pending
            || current.status == FulfillmentStatus::Cancelled
        {
            db::rollback(txn).await;
            warn!(payment_id = %payment.id, "Order changed while creating payment");
            return Err(ServiceError::InvalidTransition(format!(
                "Order payment status changed to {}",
                current.payment_status
            )));
        }

        let mut active = current.into_active_model();
        active.payment_id = Set(Some(payment.id.clone()));
        active.pix_qr_code = Set(Some(payment.qr_code.clone()));
        active.pix_qr_code_base64 = Set(payment.qr_code_base64.clone());
        active.updated_at = Set(Utc::now());
        let updated = match active.update(&txn).await {
            Ok(updated) => updated,
            Err(e) => {
                db::rollback(txn).await;
                return Err(e.into());
            }
        };
        db::commit(txn, started).await?;

        info!(payment_id = %payment.id, "PIX payment requested");
        self.publish(vec![Event::PaymentRequested {
            order_id,
            payment_id: payment.id.clone(),
        }])
        .await;

        PaymentRequest::from_order(&updated, true)
            .ok_or_else(|| ServiceError::InternalError("payment id was not stored".to_string()))
    }

    /// Applies a payment status reported for an order.
    ///
    /// An order whose payment is already approved is left untouched and the
    /// result reports `AlreadyProcessed`. Moving into `Approved` decrements
    /// stock and books revenue in the same transaction; if stock is short
    /// nothing is written. `Cancelled` is handled by [`Self::cancel_order`].
    pub async fn apply_payment_update(
        &self,
        order_id: Uuid,
        new_status: PaymentStatus,
        fulfillment: Option<FulfillmentStatus>,
        source: UpdateSource,
    ) -> Result<TransitionResult, ServiceError> {
        self.apply_update(order_id, new_status, fulfillment, source, None)
            .await
    }

    /// Applies a provider notification about `payment_id`.
    ///
    /// Fails with `Conflict` when the order already stores a different
    /// payment id. Orders without a stored id accept the notification.
    pub async fn apply_notification(
        &self,
        order_id: Uuid,
        payment_id: &str,
        new_status: PaymentStatus,
        fulfillment: Option<FulfillmentStatus>,
    ) -> Result<TransitionResult, ServiceError> {
        self.apply_update(
            order_id,
            new_status,
            fulfillment,
            UpdateSource::Webhook,
            Some(payment_id),
        )
        .await
    }

    #[instrument(skip(self), fields(order_id = %order_id, source = %source))]
    async fn apply_update(
        &self,
        order_id: Uuid,
        new_status: PaymentStatus,
        fulfillment: Option<FulfillmentStatus>,
        source: UpdateSource,
        expected_payment_id: Option<&str>,
    ) -> Result<TransitionResult, ServiceError> {
        if new_status == PaymentStatus::Cancelled {
            return self.cancel_order(order_id, source).await;
        }

        let _guard = self.locks.acquire(order_id).await;
        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;

        match self
            .apply_locked(&txn, order_id, new_status, fulfillment, expected_payment_id)
            .await
        {
            Ok((result, events)) => {
                if result.already_processed() {
                    db::rollback(txn).await;
                    info!(already_processed = true, "Payment already approved, ignoring update");
                } else {
                    db::commit(txn, started).await?;
                    info!(
                        payment_status = %result.order.payment_status,
                        inventory_mutated = result.inventory_mutated,
                        "Payment status updated"
                    );
                }
                counter!(
                    "payment_transitions_total", 1,
                    "outcome" => if result.already_processed() { "already_processed" } else { "applied" },
                    "source" => source.as_str()
                );
                self.publish(events).await;
                Ok(result)
            }
            Err(e) => {
                db::rollback(txn).await;
                counter!(
                    "payment_transitions_total", 1,
                    "outcome" => e.kind(),
                    "source" => source.as_str()
                );
                Err(e)
            }
        }
    }

    async fn apply_locked(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        new_status: PaymentStatus,
        fulfillment: Option<FulfillmentStatus>,
        expected_payment_id: Option<&str>,
    ) -> Result<(TransitionResult, PendingEvents), ServiceError> {
        let order = Self::load_locked(txn, order_id).await?;

        if let (Some(expected), Some(stored)) = (expected_payment_id, order.payment_id.as_deref()) {
            if expected != stored {
                warn!(
                    payment_id = %expected,
                    stored_payment_id = %stored,
                    "Notification names another payment"
                );
                return Err(ServiceError::Conflict(format!(
                    "Payment {} does not belong to order {}",
                    expected, order_id
                )));
            }
        }

        match order.payment_status {
            PaymentStatus::Approved => return Ok((TransitionResult::unchanged(order), vec![])),
            PaymentStatus::Cancelled => {
                return Err(ServiceError::InvalidTransition(format!(
                    "Order {} is cancelled",
                    order_id
                )))
            }
            PaymentStatus::Pending => {}
        }
        if order.status == FulfillmentStatus::Cancelled {
            return Err(ServiceError::InvalidTransition(format!(
                "Order {} is cancelled",
                order_id
            )));
        }

        let old_status = order.payment_status;
        let total = order.total;
        let payment_id = order.payment_id.clone();
        let needs_stock = new_status == PaymentStatus::Approved && !order.inventory_applied;

        let mut events = Vec::new();
        let mut active = order.into_active_model();
        active.payment_status = Set(new_status);
        if let Some(status) = fulfillment {
            active.status = Set(status);
        }
        active.updated_at = Set(Utc::now());

        let mut inventory_mutated = false;
        if needs_stock {
            let movements = InventoryLedger::decrement_for_order(txn, order_id).await?;
            active.inventory_applied = Set(true);
            inventory_mutated = true;
            events.push(Event::InventoryDecremented {
                order_id,
                lines: movements.len(),
            });
        }

        let updated = active.update(txn).await?;

        if new_status == PaymentStatus::Approved {
            if RevenueRecorder::record(txn, order_id, total).await? {
                events.push(Event::RevenueRecorded {
                    order_id,
                    amount: total,
                    recorded_at: Utc::now(),
                });
            }
            events.push(Event::PaymentApproved {
                order_id,
                payment_id,
            });
        }
        if old_status != new_status {
            events.push(Event::PaymentStatusChanged {
                order_id,
                old_status,
                new_status,
            });
        }

        Ok((
            TransitionResult {
                order: updated,
                outcome: TransitionOutcome::Applied,
                inventory_mutated,
            },
            events,
        ))
    }

    /// Cancels an order, giving its stock back if it had been taken.
    ///
    /// Cancelling twice is a no-op. Delivered orders cannot be cancelled.
    #[instrument(skip(self), fields(order_id = %order_id, source = %source))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        source: UpdateSource,
    ) -> Result<TransitionResult, ServiceError> {
        let _guard = self.locks.acquire(order_id).await;
        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;

        match Self::cancel_locked(&txn, order_id).await {
            Ok((result, events)) => {
                if result.already_processed() {
                    db::rollback(txn).await;
                    info!(already_processed = true, "Order already cancelled");
                } else {
                    db::commit(txn, started).await?;
                    info!(
                        stock_restored = result.inventory_mutated,
                        "Order cancelled"
                    );
                }
                self.publish(events).await;
                Ok(result)
            }
            Err(e) => {
                db::rollback(txn).await;
                Err(e)
            }
        }
    }

    async fn cancel_locked(
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<(TransitionResult, PendingEvents), ServiceError> {
        let order = Self::load_locked(txn, order_id).await?;

        if order.status == FulfillmentStatus::Cancelled {
            return Ok((TransitionResult::unchanged(order), vec![]));
        }
        if order.status == FulfillmentStatus::Delivered {
            return Err(ServiceError::InvalidTransition(
                "Delivered orders cannot be cancelled".to_string(),
            ));
        }

        let restore = order.inventory_applied;
        let mut events = Vec::new();
        let mut active = order.into_active_model();

        if restore {
            let movements = InventoryLedger::restore_for_order(txn, order_id).await?;
            active.inventory_applied = Set(false);
            events.push(Event::InventoryRestored {
                order_id,
                lines: movements.len(),
            });
        }

        active.status = Set(FulfillmentStatus::Cancelled);
        active.payment_status = Set(PaymentStatus::Cancelled);
        active.updated_at = Set(Utc::now());
        let updated = active.update(txn).await?;

        events.push(Event::OrderCancelled {
            order_id,
            stock_restored: restore,
        });

        Ok((
            TransitionResult {
                order: updated,
                outcome: TransitionOutcome::Applied,
                inventory_mutated: restore,
            },
            events,
        ))
    }

    /// Asks the provider for the payment status of a pending order and
    /// applies the answer.
    ///
    /// Returns `None` when the order has nothing to refresh. The provider is
    /// queried without any lock; the update re-validates under the lock.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn refresh_from_provider(
        &self,
        order: &order::Model,
        source: UpdateSource,
    ) -> Result<Option<TransitionResult>, ServiceError> {
        let payment_id = match &order.payment_id {
            Some(id)
                if !order.payment_status.is_terminal()
                    && order.status != FulfillmentStatus::Cancelled =>
            {
                id.clone()
            }
            _ => return Ok(None),
        };

        let external = self.provider.get_payment_status(payment_id).await?;
        if external != ExternalPaymentStatus::Approved {
            debug!(provider_status = external.as_str(), "Payment not approved yet");
            return Ok(None);
        }

        self.apply_payment_update(order.id, external.into_payment_status(), None, source)
            .await
            .map(Some)
    }
}
