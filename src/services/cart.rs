use crate::{
    db::DbPool,
    entities::{
        cart_item::{self, Entity as CartItemEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Cart line with the product's current name and price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CartLine {
    pub product_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    pub image_url: Option<String>,
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CartView {
    pub items: Vec<CartLine>,
    pub total: Decimal,
}

/// Largest quantity a single cart line may hold.
pub const MAX_LINE_QUANTITY: i32 = 1_000;

fn quantity_too_large(product_id: Uuid) -> ServiceError {
    ServiceError::ValidationError(format!(
        "Quantity for product {} cannot exceed {}",
        product_id, MAX_LINE_QUANTITY
    ))
}

/// Per-user shopping cart.
#[derive(Clone)]
pub struct CartService {
    db_pool: Arc<DbPool>,
}

impl CartService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    async fn active_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .filter(product::Column::IsActive.eq(true))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::product_not_found(product_id))
    }

    #[instrument(skip(self))]
    pub async fn list(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let rows = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .find_also_related(ProductEntity)
            .all(&*self.db_pool)
            .await?;

        let items: Vec<CartLine> = rows
            .into_iter()
            .filter_map(|(line, product)| {
                product.filter(|p| p.is_active).map(|p| CartLine {
                    product_id: p.id,
                    line_total: p.price * Decimal::from(line.quantity),
                    name: p.name,
                    price: p.price,
                    quantity: line.quantity,
                    image_url: p.image_url,
                    stock: p.stock,
                })
            })
            .collect();
        let total = items.iter().map(|l| l.line_total).sum();

        Ok(CartView { items, total })
    }

    /// Adds `quantity` units, creating the line or increasing it.
    #[instrument(skip(self))]
    pub async fn add(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }
        self.active_product(product_id).await?;

        let current = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db_pool)
            .await?
            .map_or(0, |line| line.quantity);
        current
            .checked_add(quantity)
            .filter(|total| *total <= MAX_LINE_QUANTITY)
            .ok_or_else(|| quantity_too_large(product_id))?;

        let now = Utc::now();
        let line = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(now),
            updated_at: Set(now),
        };
        CartItemEntity::insert(line)
            .on_conflict(
                OnConflict::columns([cart_item::Column::UserId, cart_item::Column::ProductId])
                    .value(
                        cart_item::Column::Quantity,
                        Expr::col((CartItemEntity, cart_item::Column::Quantity)).add(quantity),
                    )
                    .update_column(cart_item::Column::UpdatedAt)
                    .to_owned(),
            )
            .exec_without_returning(&*self.db_pool)
            .await?;

        debug!("Cart line added");
        self.list(user_id).await
    }

    /// Sets the quantity of a line. Zero or less removes it.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            self.remove(user_id, product_id).await?;
            return self.list(user_id).await;
        }
        if quantity > MAX_LINE_QUANTITY {
            return Err(quantity_too_large(product_id));
        }
        self.active_product(product_id).await?;

        let now = Utc::now();
        let line = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let result = CartItemEntity::insert(line)
            .on_conflict(
                OnConflict::columns([cart_item::Column::UserId, cart_item::Column::ProductId])
                    .update_columns([cart_item::Column::Quantity, cart_item::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db_pool)
            .await;
        match result {
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(e) => return Err(e.into()),
        }

        self.list(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, user_id: Uuid, product_id: Uuid) -> Result<bool, ServiceError> {
        let result = CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected > 0)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected)
    }
}
