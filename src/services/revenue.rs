use crate::{
    db::DbPool,
    entities::revenue_record::{self, Entity as RevenueEntity},
    errors::ServiceError,
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, FromQueryResult, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const REVENUE_STATUS_APPROVED: &str = "approved";

/// Totals over every revenue record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RevenueSummary {
    pub total_amount: Decimal,
    pub record_count: u64,
}

#[derive(Debug, FromQueryResult)]
struct SummaryRow {
    total_amount: Option<Decimal>,
    record_count: i64,
}

/// Append-only revenue ledger, one record per approved order.
#[derive(Clone)]
pub struct RevenueRecorder {
    db_pool: Arc<DbPool>,
}

impl RevenueRecorder {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Inserts the revenue record for `order_id` unless one exists.
    ///
    /// Returns `true` when a row was written. Runs on the caller's
    /// transaction so it commits or rolls back with the approval.
    #[instrument(skip(conn), fields(order_id = %order_id, amount = %amount))]
    pub async fn record<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        amount: Decimal,
    ) -> Result<bool, ServiceError> {
        let record = revenue_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            amount: Set(amount),
            status: Set(REVENUE_STATUS_APPROVED.to_string()),
            created_at: Set(Utc::now()),
        };

        let result = RevenueEntity::insert(record)
            .on_conflict(
                OnConflict::column(revenue_record::Column::OrderId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await;

        match result {
            Ok(0) | Err(DbErr::RecordNotInserted) => {
                warn!("Revenue already recorded for order");
                counter!("revenue_records_total", 1, "result" => "duplicate");
                Ok(false)
            }
            Ok(_) => {
                counter!("revenue_records_total", 1, "result" => "inserted");
                Ok(true)
            }
            Err(e) => Err(ServiceError::DatabaseError(e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn summary(&self) -> Result<RevenueSummary, ServiceError> {
        let row = RevenueEntity::find()
            .select_only()
            .column_as(revenue_record::Column::Amount.sum(), "total_amount")
            .column_as(revenue_record::Column::Id.count(), "record_count")
            .into_model::<SummaryRow>()
            .one(&*self.db_pool)
            .await?;

        Ok(row
            .map(|r| RevenueSummary {
                total_amount: r.total_amount.unwrap_or(Decimal::ZERO),
                record_count: u64::try_from(r.record_count).unwrap_or(0),
            })
            .unwrap_or(RevenueSummary {
                total_amount: Decimal::ZERO,
                record_count: 0,
            }))
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<revenue_record::Model>, ServiceError> {
        Ok(RevenueEntity::find()
            .order_by_desc(revenue_record::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    /// Administrative bulk delete. Returns the number of removed records.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<u64, ServiceError> {
        let result = RevenueEntity::delete_many().exec(&*self.db_pool).await?;
        info!(deleted = result.rows_affected, "Revenue records cleared");
        Ok(result.rows_affected)
    }
}
