use crate::{
    entities::{order_item, product},
    errors::ServiceError,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Quantity moved for one product by a decrement or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockMovement {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Stock bookkeeping for orders.
///
/// Both operations must run on the transaction that also changes the order,
/// so a failure anywhere rolls the stock change back with it. Neither is
/// idempotent on its own: the caller tracks whether an order's stock is
/// currently applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryLedger;

impl InventoryLedger {
    /// Sum of quantities per product for an order, in product id order.
    async fn demand_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::ProductId)
            .all(conn)
            .await?;

        let mut demand = BTreeMap::new();
        for item in items {
            *demand.entry(item.product_id).or_insert(0) += item.quantity;
        }
        Ok(demand)
    }

    fn insufficient(product: &product::Model, requested: i32) -> ServiceError {
        ServiceError::InsufficientStock {
            product_id: product.id,
            product_name: product.name.clone(),
            available: product.stock,
            requested,
        }
    }

    /// Takes every line item of the order out of stock, or nothing at all.
    ///
    /// All lines are checked before any row is written. Each write is also
    /// conditional on `stock >= quantity`, so a concurrent decrement that
    /// slipped in between check and write is caught as insufficient stock
    /// instead of driving stock negative.
    #[instrument(skip(conn), fields(order_id = %order_id))]
    pub async fn decrement_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<StockMovement>, ServiceError> {
        let demand = Self::demand_for_order(conn, order_id).await?;

        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(demand.keys().copied()))
            .all(conn)
            .await?;

        for (&product_id, &requested) in &demand {
            let product = products
                .iter()
                .find(|p| p.id == product_id)
                .ok_or_else(|| ServiceError::product_not_found(product_id))?;
            if product.stock < requested {
                warn!(
                    product_id = %product_id,
                    available = product.stock,
                    requested,
                    "Insufficient stock for order"
                );
                return Err(Self::insufficient(product, requested));
            }
        }

        let now = Utc::now();
        let mut movements = Vec::with_capacity(demand.len());
        for (&product_id, &quantity) in &demand {
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(product_id))
                .filter(product::Column::Stock.gte(quantity))
                .exec(conn)
                .await?;

            if result.rows_affected != 1 {
                let current = product::Entity::find_by_id(product_id)
                    .one(conn)
                    .await?
                    .ok_or_else(|| ServiceError::product_not_found(product_id))?;
                warn!(
                    product_id = %product_id,
                    available = current.stock,
                    requested = quantity,
                    "Stock changed during decrement"
                );
                return Err(Self::insufficient(&current, quantity));
            }

            debug!(product_id = %product_id, quantity, "Stock decremented");
            movements.push(StockMovement {
                product_id,
                quantity,
            });
        }

        counter!("inventory_decrements_total", 1);
        Ok(movements)
    }

    /// Gives every line item of the order back to stock.
    #[instrument(skip(conn), fields(order_id = %order_id))]
    pub async fn restore_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<StockMovement>, ServiceError> {
        let demand = Self::demand_for_order(conn, order_id).await?;
        let now = Utc::now();

        let mut movements = Vec::with_capacity(demand.len());
        for (&product_id, &quantity) in &demand {
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(product_id))
                .exec(conn)
                .await?;

            if result.rows_affected != 1 {
                return Err(ServiceError::product_not_found(product_id));
            }
            movements.push(StockMovement {
                product_id,
                quantity,
            });
        }

        counter!("inventory_restores_total", 1);
        Ok(movements)
    }
}
