use crate::{
    db::{self, DbPool},
    entities::{
        cart_item,
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use std::{sync::Arc, time::Instant};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("must not be negative".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 255, message = "Product name must be between 1 and 255 characters"))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(custom = "non_negative")]
    #[schema(value_type = String, example = "12.90")]
    pub price: Decimal,
    #[validate(range(min = 0, message = "Stock cannot be negative"))]
    pub stock: i32,
    #[validate(length(min = 1, max = 100))]
    pub category: String,
    #[validate(url(message = "Image URL must be a valid URL"))]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateProductRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(custom = "non_negative")]
    #[schema(value_type = Option<String>)]
    pub price: Option<Decimal>,
    #[validate(range(min = 0, message = "Stock cannot be negative"))]
    pub stock: Option<i32>,
    #[validate(length(min = 1, max = 100))]
    pub category: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
}

/// Catalog maintenance. Changing a price never touches existing orders.
#[derive(Clone)]
pub struct ProductService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl ProductService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Active products, optionally limited to one category, by name.
    pub async fn list(&self, category: Option<&str>) -> Result<Vec<product::Model>, ServiceError> {
        let mut query = ProductEntity::find().filter(product::Column::IsActive.eq(true));
        if let Some(category) = category.map(str::trim).filter(|c| !c.is_empty()) {
            query = query.filter(product::Column::Category.eq(category));
        }
        Ok(query
            .order_by_asc(product::Column::Name)
            .all(&*self.db_pool)
            .await?)
    }

    /// An active product.
    pub async fn get(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .filter(product::Column::IsActive.eq(true))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::product_not_found(product_id))
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        request: CreateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        let now = Utc::now();

        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name.trim().to_string()),
            description: Set(request.description),
            price: Set(request.price),
            stock: Set(request.stock),
            category: Set(request.category.trim().to_string()),
            image_url: Set(request.image_url),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await?;

        info!(product_id = %model.id, "Product created");
        Ok(model)
    }

    #[instrument(skip(self, request), fields(product_id = %product_id))]
    pub async fn update(
        &self,
        product_id: Uuid,
        request: UpdateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        let current = self.get(product_id).await?;

        let mut active = current.into_active_model();
        if let Some(name) = request.name {
            active.name = Set(name.trim().to_string());
        }
        if request.description.is_some() {
            active.description = Set(request.description);
        }
        if let Some(price) = request.price {
            active.price = Set(price);
        }
        if let Some(stock) = request.stock {
            active.stock = Set(stock);
        }
        if let Some(category) = request.category {
            active.category = Set(category.trim().to_string());
        }
        if request.image_url.is_some() {
            active.image_url = Set(request.image_url);
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(&*self.db_pool).await?;
        info!("Product updated");
        Ok(updated)
    }

    /// Removes a product from sale and from every cart.
    ///
    /// The row is kept: past order items still reference it.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn archive(&self, product_id: Uuid) -> Result<(), ServiceError> {
        let current = self.get(product_id).await?;

        let started = Instant::now();
        let txn = db::begin(&self.db_pool).await?;
        let result = async {
            let mut active = current.into_active_model();
            active.is_active = Set(false);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;

            let removed = cart_item::Entity::delete_many()
                .filter(cart_item::Column::ProductId.eq(product_id))
                .exec(&txn)
                .await?;
            Ok::<_, ServiceError>(removed.rows_affected)
        }
        .await;

        let carts_cleared = match result {
            Ok(n) => n,
            Err(e) => {
                db::rollback(txn).await;
                return Err(e);
            }
        };
        db::commit(txn, started).await?;

        info!(carts_cleared, "Product archived");
        self.event_sender
            .send_or_log(Event::ProductArchived {
                product_id,
                carts_cleared,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(price: Decimal, stock: i32) -> CreateProductRequest {
        CreateProductRequest {
            name: "Açaí 500ml".into(),
            description: None,
            price,
            stock,
            category: "bowls".into(),
            image_url: None,
        }
    }

    #[test]
    fn negative_price_and_stock_are_invalid() {
        assert!(request(dec!(12.90), 5).validate().is_ok());
        assert!(request(dec!(0), 0).validate().is_ok());
        assert!(request(dec!(-0.01), 5).validate().is_err());
        assert!(request(dec!(1), -1).validate().is_err());
    }

    #[test]
    fn update_validates_only_present_fields() {
        assert!(UpdateProductRequest::default().validate().is_ok());
        let bad = UpdateProductRequest {
            price: Some(dec!(-3)),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
