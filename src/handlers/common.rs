use crate::{
    entities::{order, FulfillmentStatus, PaymentStatus},
    errors::ServiceError,
    services::payment_state::TransitionResult,
    ApiResponse,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;
use validator::Validate;

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input
        .validate()
        .map_err(|e| ServiceError::ValidationError(format!("Validation failed: {}", e)))
}

/// Body returned by every payment or fulfillment transition.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransitionResponse {
    pub order: order::Model,
    /// The order was already in the requested state; nothing was changed.
    pub already_processed: bool,
    /// Stock was decremented or restored by this call.
    pub inventory_mutated: bool,
}

impl From<TransitionResult> for TransitionResponse {
    fn from(result: TransitionResult) -> Self {
        Self {
            already_processed: result.already_processed(),
            inventory_mutated: result.inventory_mutated,
            order: result.order,
        }
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['-', ' '], "_")
}

/// Parses a payment status in any vocabulary clients use, English or Portuguese.
pub fn parse_payment_status(raw: &str) -> Result<PaymentStatus, ServiceError> {
    match normalize(raw).as_str() {
        "pending" | "pendente" => Ok(PaymentStatus::Pending),
        "approved" | "aprovado" | "aprovada" => Ok(PaymentStatus::Approved),
        "cancelled" | "canceled" | "cancelado" | "cancelada" => Ok(PaymentStatus::Cancelled),
        _ => Err(ServiceError::InvalidStatus(format!(
            "Unknown payment status '{}'",
            raw
        ))),
    }
}

/// Parses a fulfillment status. `confirmed` and `pending` are older names
/// for `preparing`.
pub fn parse_fulfillment_status(raw: &str) -> Result<FulfillmentStatus, ServiceError> {
    match normalize(raw).as_str() {
        "preparing" | "confirmed" | "pending" | "em_preparação" | "em_preparacao"
        | "preparando" => Ok(FulfillmentStatus::Preparing),
        "out_for_delivery" | "saiu_para_entrega" => Ok(FulfillmentStatus::OutForDelivery),
        "delivered" | "entregue" => Ok(FulfillmentStatus::Delivered),
        "cancelled" | "canceled" | "cancelado" | "cancelada" => Ok(FulfillmentStatus::Cancelled),
        _ => Err(ServiceError::InvalidStatus(format!(
            "Unknown order status '{}'",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case("approved", PaymentStatus::Approved)]
    #[case("aprovado", PaymentStatus::Approved)]
    #[case(" Aprovado ", PaymentStatus::Approved)]
    #[case("pending", PaymentStatus::Pending)]
    #[case("pendente", PaymentStatus::Pending)]
    #[case("cancelado", PaymentStatus::Cancelled)]
    #[case("canceled", PaymentStatus::Cancelled)]
    fn payment_aliases(#[case] raw: &str, #[case] expected: PaymentStatus) {
        assert_eq!(parse_payment_status(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("preparing", FulfillmentStatus::Preparing)]
    #[case("confirmed", FulfillmentStatus::Preparing)]
    #[case("pending", FulfillmentStatus::Preparing)]
    #[case("em preparação", FulfillmentStatus::Preparing)]
    #[case("Em Preparação", FulfillmentStatus::Preparing)]
    #[case("em_preparacao", FulfillmentStatus::Preparing)]
    #[case("preparando", FulfillmentStatus::Preparing)]
    #[case("out_for_delivery", FulfillmentStatus::OutForDelivery)]
    #[case("saiu para entrega", FulfillmentStatus::OutForDelivery)]
    #[case("saiu_para_entrega", FulfillmentStatus::OutForDelivery)]
    #[case("entregue", FulfillmentStatus::Delivered)]
    #[case("cancelado", FulfillmentStatus::Cancelled)]
    fn fulfillment_aliases(#[case] raw: &str, #[case] expected: FulfillmentStatus) {
        assert_eq!(parse_fulfillment_status(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("paid")]
    #[case("shipped")]
    fn unknown_values_are_invalid_status(#[case] raw: &str) {
        assert_matches!(parse_fulfillment_status(raw), Err(ServiceError::InvalidStatus(_)));
        assert_matches!(parse_payment_status(raw), Err(ServiceError::InvalidStatus(_)));
    }
}
