use crate::{
    auth::AuthUser,
    db::{self, DbPool},
    entities::{
        cart_item,
        order::{self, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        product, FulfillmentStatus, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::payment_state::{
        PaymentStateMachine, TransitionOutcome, TransitionResult, UpdateSource,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_PAYMENT_METHOD: &str = "pix";

/// One requested line of a new order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLineDraft {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Everything needed to place an order. Prices are never taken from the caller.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub user_id: Uuid,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub payment_method: String,
    /// Empty means "order the user's cart".
    pub items: Vec<OrderLineDraft>,
}

/// Order together with its line items.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Optional filters for the administrator order list.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderFilter {
    pub payment_status: Option<PaymentStatus>,
    pub status: Option<FulfillmentStatus>,
}

/// Sums a draft's lines per product. Quantities must be positive.
pub fn merge_lines(lines: &[OrderLineDraft]) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
    let mut merged = BTreeMap::new();
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity for product {} must be positive",
                line.product_id
            )));
        }
        let entry = merged.entry(line.product_id).or_insert(0i32);
        *entry = entry.checked_add(line.quantity).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Quantity for product {} is too large",
                line.product_id
            ))
        })?;
    }
    Ok(merged)
}

/// Order total from current prices: sum of `price * quantity`.
pub fn order_total(lines: impl IntoIterator<Item = (Decimal, i32)>) -> Decimal {
    lines
        .into_iter()
        .map(|(price, quantity)| price * Decimal::from(quantity))
        .sum()
}

fn required(field: &str, value: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::ValidationError(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// Order persistence and the read paths around it.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    payments: PaymentStateMachine,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        payments: PaymentStateMachine,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            payments,
            event_sender,
        }
    }

    /// Places an order: prices are read now, the total is frozen, the
    /// user's cart is emptied. Nothing is written if any product is missing.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id))]
    pub async fn create(&self, draft: OrderDraft) -> Result<OrderWithItems, ServiceError> {
        let customer_name = required("customer_name", &draft.customer_name)?;
        let customer_phone = required("customer_phone", &draft.customer_phone)?;
        let delivery_address = required("delivery_address", &draft.delivery_address)?;
        let payment_method = match draft.payment_method.trim() {
            "" => DEFAULT_PAYMENT_METHOD.to_string(),
            m => m.to_lowercase(),
        };
        let requested = merge_lines(&draft.items)?;

        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;

        let result = self
            .create_in_txn(
                &txn,
                draft.user_id,
                requested,
                customer_name,
                customer_phone,
                delivery_address,
                payment_method,
            )
            .await;

        let created = match result {
            Ok(created) => created,
            Err(e) => {
                db::rollback(txn).await;
                if !matches!(e, ServiceError::NotFound(_) | ServiceError::ValidationError(_)) {
                    error!(error = %e, "Failed to create order");
                }
                return Err(e);
            }
        };
        db::commit(txn, started).await?;

        info!(order_id = %created.order.id, total = %created.order.total, "Order created");
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: created.order.id,
                user_id: created.order.user_id,
                total: created.order.total,
            })
            .await;

        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_in_txn(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        mut requested: BTreeMap<Uuid, i32>,
        customer_name: String,
        customer_phone: String,
        delivery_address: String,
        payment_method: String,
    ) -> Result<OrderWithItems, ServiceError> {
        if requested.is_empty() {
            let cart = cart_item::Entity::find()
                .filter(cart_item::Column::UserId.eq(user_id))
                .all(txn)
                .await?;
            for line in cart {
                *requested.entry(line.product_id).or_insert(0) += line.quantity;
            }
        }
        if requested.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }

        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(requested.keys().copied()))
            .filter(product::Column::IsActive.eq(true))
            .all(txn)
            .await?;

        let mut priced = Vec::with_capacity(requested.len());
        for (&product_id, &quantity) in &requested {
            let product = products
                .iter()
                .find(|p| p.id == product_id)
                .ok_or_else(|| ServiceError::product_not_found(product_id))?;
            priced.push((product, quantity));
        }

        let total = order_total(priced.iter().map(|(p, q)| (p.price, *q)));
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            customer_name: Set(customer_name),
            customer_phone: Set(customer_phone),
            delivery_address: Set(delivery_address),
            total: Set(total),
            payment_method: Set(payment_method),
            status: Set(FulfillmentStatus::Preparing),
            payment_status: Set(PaymentStatus::Pending),
            payment_id: Set(None),
            pix_qr_code: Set(None),
            pix_qr_code_base64: Set(None),
            inventory_applied: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        let mut items = Vec::with_capacity(priced.len());
        for (product, quantity) in priced {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                product_name: Set(product.name.clone()),
                quantity: Set(quantity),
                price: Set(product.price),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
            items.push(item);
        }

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(txn)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    async fn load_with_items<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::order_not_found(order_id))?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(conn)
            .await?;
        Ok(OrderWithItems { order, items })
    }

    /// Returns the order if `requester` may see it. Other users' orders are
    /// reported as missing.
    ///
    /// A pending order with a payment id is first refreshed from the
    /// provider; a failed refresh is logged and the stored state returned.
    #[instrument(skip(self, requester), fields(order_id = %order_id))]
    pub async fn get(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<OrderWithItems, ServiceError> {
        let found = Self::load_with_items(&*self.db_pool, order_id).await?;
        if !requester.is_admin() && found.order.user_id != requester.user_id {
            return Err(ServiceError::order_not_found(order_id));
        }

        match self
            .payments
            .refresh_from_provider(&found.order, UpdateSource::Poll)
            .await
        {
            Ok(Some(_)) => Self::load_with_items(&*self.db_pool, order_id).await,
            Ok(None) => Ok(found),
            Err(e) => {
                warn!(error = %e, "Payment status refresh failed, returning stored order");
                Ok(found)
            }
        }
    }

    /// The user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<OrderWithItems>, ServiceError> {
        let rows = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_asc(order::Column::Id)
            .find_with_related(OrderItemEntity)
            .all(&*self.db_pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(order, items)| OrderWithItems { order, items })
            .collect())
    }

    /// All orders for administrators, newest first.
    #[instrument(skip(self))]
    pub async fn list_all(&self, filter: OrderFilter) -> Result<Vec<OrderWithItems>, ServiceError> {
        let mut query = OrderEntity::find();
        if let Some(payment_status) = filter.payment_status {
            query = query.filter(order::Column::PaymentStatus.eq(payment_status));
        }
        if let Some(status) = filter.status {
            query = query.filter(order::Column::Status.eq(status));
        }
        let rows = query
            .order_by_desc(order::Column::CreatedAt)
            .order_by_asc(order::Column::Id)
            .find_with_related(OrderItemEntity)
            .all(&*self.db_pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(order, items)| OrderWithItems { order, items })
            .collect())
    }

    /// Moves an order along its fulfillment lifecycle.
    ///
    /// `Cancelled` goes through cancellation so stock is given back.
    /// Dispatch and delivery require an approved payment.
    #[instrument(skip(self), fields(order_id = %order_id, status = %status))]
    pub async fn update_fulfillment(
        &self,
        order_id: Uuid,
        status: FulfillmentStatus,
    ) -> Result<TransitionResult, ServiceError> {
        if status == FulfillmentStatus::Cancelled {
            return self
                .payments
                .cancel_order(order_id, UpdateSource::Admin)
                .await;
        }

        let _guard = self.payments.locks().acquire(order_id).await;
        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;

        let outcome: Result<(order::Model, Option<FulfillmentStatus>), ServiceError> = async {
            db::lock_row_for_update(&txn, "orders", order_id).await?;
            let current = OrderEntity::find_by_id(order_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::order_not_found(order_id))?;

            if current.status == FulfillmentStatus::Cancelled {
                return Err(ServiceError::InvalidTransition(
                    "Cancelled orders cannot change status".to_string(),
                ));
            }
            if current.status == status {
                return Ok((current, None));
            }
            if matches!(
                status,
                FulfillmentStatus::OutForDelivery | FulfillmentStatus::Delivered
            ) && current.payment_status != PaymentStatus::Approved
            {
                return Err(ServiceError::InvalidTransition(format!(
                    "Order cannot be {} before payment is approved",
                    status
                )));
            }

            let old_status = current.status;
            let mut active = current.into_active_model();
            active.status = Set(status);
            active.updated_at = Set(Utc::now());
            let updated = active.update(&txn).await?;
            Ok((updated, Some(old_status)))
        }
        .await;

        match outcome {
            Ok((order, Some(old_status))) => {
                db::commit(txn, started).await?;
                info!(%old_status, "Fulfillment status updated");
                self.event_sender
                    .send_or_log(Event::FulfillmentChanged {
                        order_id,
                        old_status,
                        new_status: status,
                    })
                    .await;
                Ok(TransitionResult {
                    order,
                    outcome: TransitionOutcome::Applied,
                    inventory_mutated: false,
                })
            }
            Ok((order, None)) => {
                db::rollback(txn).await;
                Ok(TransitionResult {
                    order,
                    outcome: TransitionOutcome::AlreadyProcessed,
                    inventory_mutated: false,
                })
            }
            Err(e) => {
                db::rollback(txn).await;
                Err(e)
            }
        }
    }

    /// Cancellation requested by a user. Customers may cancel their own
    /// orders until the payment is approved; administrators any order.
    #[instrument(skip(self, requester), fields(order_id = %order_id))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<TransitionResult, ServiceError> {
        if requester.is_admin() {
            return self
                .payments
                .cancel_order(order_id, UpdateSource::Admin)
                .await;
        }

        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .filter(|o| o.user_id == requester.user_id)
            .ok_or_else(|| ServiceError::order_not_found(order_id))?;
        if order.payment_status == PaymentStatus::Approved {
            return Err(ServiceError::InvalidTransition(
                "Paid orders can only be cancelled by the store".to_string(),
            ));
        }

        self.payments
            .cancel_order(order_id, UpdateSource::Customer)
            .await
    }

    /// Orders whose payment may still be approved at the provider.
    pub async fn list_awaiting_payment(&self) -> Result<Vec<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .filter(order::Column::PaymentId.is_not_null())
            .filter(order::Column::Status.ne(FulfillmentStatus::Cancelled))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}
