use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::common::{created_response, validate_input, TransitionResponse};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        orders::{OrderDraft, OrderLineDraft, OrderWithItems, DEFAULT_PAYMENT_METHOD},
        payment_state::PaymentRequest,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateOrderLineRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 999, message = "Quantity must be between 1 and 999"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 255, message = "Customer name is required"))]
    pub customer_name: String,
    #[validate(length(min = 8, max = 32, message = "Customer phone is required"))]
    pub customer_phone: String,
    #[validate(length(min = 1, max = 1000, message = "Delivery address is required"))]
    pub delivery_address: String,
    pub payment_method: Option<String>,
    /// Lines to order; when empty the caller's cart is ordered.
    #[serde(default)]
    #[validate]
    pub items: Vec<CreateOrderLineRequest>,
}

impl CreateOrderRequest {
    fn into_draft(self, user_id: Uuid) -> OrderDraft {
        OrderDraft {
            user_id,
            customer_name: self.customer_name,
            customer_phone: self.customer_phone,
            delivery_address: self.delivery_address,
            payment_method: self
                .payment_method
                .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string()),
            items: self
                .items
                .into_iter()
                .map(|line| OrderLineDraft {
                    product_id: line.product_id,
                    quantity: line.quantity,
                })
                .collect(),
        }
    }
}

/// Routes for the caller's own orders.
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/payment", post(request_payment))
        .route("/:id/cancel", post(cancel_order))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Places an order at current catalog prices. Stock is only taken when the payment is approved.",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderWithItems>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Validation error", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = state
        .services
        .orders
        .create(payload.into_draft(user.user_id))
        .await?;
    Ok(created_response(order))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    responses(
        (status = 200, description = "Orders, newest first", body = ApiResponse<Vec<OrderWithItems>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<OrderWithItems>> {
    let orders = state.services.orders.list_by_user(user.user_id).await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    description = "Returns the order. A pending PIX payment is checked with the provider first.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderWithItems>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderWithItems> {
    let order = state.services.orders.get(id, &user).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment",
    summary = "Create PIX payment",
    description = "Creates the PIX charge for the order. Calling it again returns the same charge.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "PIX payment", body = ApiResponse<PaymentRequest>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Order cannot be paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse),
        (status = 504, description = "Payment provider timeout", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn request_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<PaymentRequest> {
    // Ownership check; reports foreign orders as missing.
    state.services.orders.get(id, &user).await?;
    let payment = state.services.payments.request_payment(id).await?;
    let message = if payment.created {
        "PIX payment created"
    } else {
        "PIX payment already exists"
    };
    Ok(Json(ApiResponse::success(payment).with_message(message)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    description = "Cancels the order and gives back any stock it took. Cancelling twice is a no-op.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<TransitionResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Order cannot be cancelled", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<TransitionResponse> {
    let result = state.services.orders.cancel(id, &user).await?;
    Ok(Json(ApiResponse::success(result.into())))
}
