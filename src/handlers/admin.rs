use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{parse_fulfillment_status, parse_payment_status, TransitionResponse};
use crate::{
    auth::AdminUser,
    entities::{revenue_record, FulfillmentStatus, PaymentStatus},
    errors::ServiceError,
    services::{
        orders::{OrderFilter, OrderWithItems},
        payment_state::UpdateSource,
        revenue::RevenueSummary,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AdminOrderQuery {
    /// Payment status, English or Portuguese
    pub payment_status: Option<String>,
    /// Fulfillment status, English or Portuguese
    pub status: Option<String>,
}

impl AdminOrderQuery {
    fn into_filter(self) -> Result<OrderFilter, ServiceError> {
        Ok(OrderFilter {
            payment_status: self
                .payment_status
                .as_deref()
                .map(parse_payment_status)
                .transpose()?,
            status: self
                .status
                .as_deref()
                .map(parse_fulfillment_status)
                .transpose()?,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateFulfillmentRequest {
    #[schema(example = "saiu para entrega")]
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePaymentStatusRequest {
    #[serde(alias = "payment_status")]
    #[schema(example = "aprovado")]
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevenueReport {
    pub summary: RevenueSummary,
    pub records: Vec<revenue_record::Model>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevenueCleared {
    pub deleted: u64,
}

/// Store administration. Every route requires the admin role.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id/status", patch(update_fulfillment))
        .route("/orders/:id/payment", patch(update_payment_status))
        .route("/orders/:id/confirm-payment", post(confirm_payment))
        .route("/orders/:id/simulate-payment", post(simulate_payment))
        .route("/revenue", get(get_revenue).delete(clear_revenue))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders",
    summary = "List all orders",
    params(AdminOrderQuery),
    responses(
        (status = 200, description = "Orders, newest first", body = ApiResponse<Vec<OrderWithItems>>),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AdminOrderQuery>,
) -> ApiResult<Vec<OrderWithItems>> {
    let orders = state.services.orders.list_all(query.into_filter()?).await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/admin/orders/{id}/status",
    summary = "Update fulfillment status",
    description = "Accepts English or Portuguese names. `cancelled` cancels the order and restores stock.",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateFulfillmentRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<TransitionResponse>),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn update_fulfillment(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateFulfillmentRequest>,
) -> ApiResult<TransitionResponse> {
    let status = parse_fulfillment_status(&payload.status)?;
    let result = state.services.orders.update_fulfillment(id, status).await?;
    Ok(Json(ApiResponse::success(result.into())))
}

#[utoipa::path(
    patch,
    path = "/api/v1/admin/orders/{id}/payment",
    summary = "Set payment status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdatePaymentStatusRequest,
    responses(
        (status = 200, description = "Payment status applied", body = ApiResponse<TransitionResponse>),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePaymentStatusRequest>,
) -> ApiResult<TransitionResponse> {
    let status = parse_payment_status(&payload.status)?;
    let fulfillment = (status == PaymentStatus::Approved).then_some(FulfillmentStatus::Preparing);
    let result = state
        .services
        .payments
        .apply_payment_update(id, status, fulfillment, UpdateSource::Admin)
        .await?;
    Ok(Json(ApiResponse::success(result.into())))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/confirm-payment",
    summary = "Confirm payment manually",
    description = "Marks the payment approved, e.g. after checking the bank statement. Repeating it is a no-op.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payment approved", body = ApiResponse<TransitionResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Order cancelled", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<TransitionResponse> {
    let result = state
        .services
        .payments
        .apply_payment_update(
            id,
            PaymentStatus::Approved,
            Some(FulfillmentStatus::Preparing),
            UpdateSource::Admin,
        )
        .await?;
    info!(order_id = %id, admin_id = %admin.user_id, already_processed = result.already_processed(), "Payment confirmed by administrator");
    Ok(Json(ApiResponse::success(result.into())))
}

/// Development aid: behaves as if the provider had approved the payment.
/// Hidden in production.
#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/simulate-payment",
    summary = "Simulate an approved payment",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payment approved", body = ApiResponse<TransitionResponse>),
        (status = 404, description = "Order not found or not available in production", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn simulate_payment(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<TransitionResponse> {
    if state.config.is_production() {
        warn!(order_id = %id, "Payment simulation refused in production");
        return Err(ServiceError::NotFound(
            "Payment simulation is not available".to_string(),
        ));
    }
    let result = state
        .services
        .payments
        .apply_payment_update(
            id,
            PaymentStatus::Approved,
            Some(FulfillmentStatus::Preparing),
            UpdateSource::Simulation,
        )
        .await?;
    Ok(Json(ApiResponse::success(result.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/revenue",
    summary = "Revenue report",
    responses(
        (status = 200, description = "Revenue totals and records", body = ApiResponse<RevenueReport>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_revenue(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<RevenueReport> {
    let summary = state.services.revenue.summary().await?;
    let records = state.services.revenue.list().await?;
    Ok(Json(ApiResponse::success(RevenueReport { summary, records })))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/revenue",
    summary = "Clear revenue records",
    responses(
        (status = 200, description = "Records deleted", body = ApiResponse<RevenueCleared>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn clear_revenue(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> ApiResult<RevenueCleared> {
    let deleted = state.services.revenue.clear_all().await?;
    warn!(admin_id = %admin.user_id, deleted, "Revenue records cleared");
    Ok(Json(ApiResponse::success(RevenueCleared { deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn order_filter_accepts_portuguese_names() {
        let filter = AdminOrderQuery {
            payment_status: Some("aprovado".into()),
            status: Some("saiu para entrega".into()),
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.payment_status, Some(PaymentStatus::Approved));
        assert_eq!(filter.status, Some(FulfillmentStatus::OutForDelivery));
    }

    #[test]
    fn empty_query_means_no_filter() {
        let filter = AdminOrderQuery::default().into_filter().unwrap();
        assert_eq!(filter.payment_status, None);
        assert_eq!(filter.status, None);
    }

    #[test]
    fn unknown_filter_value_is_rejected() {
        let query = AdminOrderQuery {
            payment_status: Some("refunded".into()),
            status: None,
        };
        assert_matches!(query.into_filter(), Err(ServiceError::InvalidStatus(_)));
    }

    #[test]
    fn payment_request_accepts_either_field_name() {
        let a: UpdatePaymentStatusRequest = serde_json::from_str(r#"{"status":"pendente"}"#).unwrap();
        let b: UpdatePaymentStatusRequest =
            serde_json::from_str(r#"{"payment_status":"approved"}"#).unwrap();
        assert_eq!(a.status, "pendente");
        assert_eq!(b.status, "approved");
    }
}
