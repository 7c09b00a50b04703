use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{FulfillmentStatus, PaymentStatus},
    errors::ServiceError,
    services::payment_provider::ExternalPaymentStatus,
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// What the webhook did with a notification.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub processed: bool,
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_processed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl WebhookAck {
    fn ignored(order_id: Uuid, reason: &'static str) -> Self {
        Self {
            processed: false,
            order_id,
            payment_status: None,
            already_processed: None,
            reason: Some(reason),
        }
    }
}

/// Fields the provider sends with each notification.
#[derive(Debug, PartialEq, Eq)]
struct PaymentNotification {
    payment_id: String,
    status: String,
    order_id: Uuid,
}

impl PaymentNotification {
    fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        let json: Value = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

        // Provider ids arrive as numbers or strings.
        let payment_id = match json.get("paymentId") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let status = json
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let order_id = json.get("orderId").and_then(Value::as_str);

        let (Some(payment_id), Some(status), Some(order_id)) = (payment_id, status, order_id)
        else {
            return Err(ServiceError::BadRequest(
                "paymentId, status and orderId are required".to_string(),
            ));
        };
        let order_id = Uuid::parse_str(order_id.trim())
            .map_err(|_| ServiceError::BadRequest("orderId is not a valid id".to_string()))?;

        Ok(Self {
            payment_id,
            status: status.to_string(),
            order_id,
        })
    }
}

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body(content = String, description = "JSON with paymentId, status and orderId"),
    responses(
        (status = 200, description = "Notification handled or ignored", body = WebhookAck),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock; the provider should retry", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        let ok = verify_signature(
            &headers,
            &body,
            secret,
            state.config.payment_webhook_tolerance_secs,
        );
        if !ok {
            warn!("Payment webhook signature verification failed");
            counter!("payment_webhooks_total", 1, "result" => "bad_signature");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let notification = PaymentNotification::parse(&body).map_err(|e| {
        counter!("payment_webhooks_total", 1, "result" => "bad_payload");
        e
    })?;
    let status = ExternalPaymentStatus::from_provider(&notification.status).into_payment_status();
    info!(
        order_id = %notification.order_id,
        payment_id = %notification.payment_id,
        provider_status = %notification.status,
        "Payment webhook received"
    );

    let result = state
        .services
        .payments
        .apply_notification(
            notification.order_id,
            &notification.payment_id,
            status,
            Some(FulfillmentStatus::Preparing),
        )
        .await;

    let ack = match result {
        Ok(result) => {
            counter!("payment_webhooks_total", 1, "result" => "processed");
            WebhookAck {
                processed: true,
                order_id: notification.order_id,
                payment_status: Some(result.order.payment_status),
                already_processed: Some(result.already_processed()),
                reason: None,
            }
        }
        Err(ServiceError::NotFound(_)) => {
            info!(order_id = %notification.order_id, "Webhook for unknown order ignored");
            counter!("payment_webhooks_total", 1, "result" => "unknown_order");
            WebhookAck::ignored(notification.order_id, "order_not_found")
        }
        Err(ServiceError::InvalidTransition(msg)) => {
            warn!(order_id = %notification.order_id, reason = %msg, "Webhook transition ignored");
            counter!("payment_webhooks_total", 1, "result" => "ignored");
            WebhookAck::ignored(notification.order_id, "invalid_transition")
        }
        Err(ServiceError::Conflict(_)) => {
            counter!("payment_webhooks_total", 1, "result" => "payment_mismatch");
            WebhookAck::ignored(notification.order_id, "payment_mismatch")
        }
        Err(e) => {
            counter!("payment_webhooks_total", 1, "result" => "failed");
            return Err(e);
        }
    };

    Ok((StatusCode::OK, Json(ack)))
}

/// Checks `x-signature`: hex HMAC-SHA256 of `"{x-timestamp}.{body}"`.
/// Timestamps outside `tolerance_secs` are rejected.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    let (Some(ts), Some(sig)) = (
        headers.get(TIMESTAMP_HEADER).and_then(|h| h.to_str().ok()),
        headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok()),
    ) else {
        return false;
    };

    let Ok(ts_i) = ts.trim().parse::<i64>() else {
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if now.abs_diff(ts_i) > tolerance_secs {
        return false;
    }

    match sign(secret, ts.trim(), payload) {
        Some(expected) => constant_time_eq(&expected, sig.trim()),
        None => false,
    }
}

/// Hex signature for a payload, as the provider computes it.
pub fn sign(secret: &str, timestamp: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
