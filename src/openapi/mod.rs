use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PIX Commerce API",
        version = "1.0.0",
        description = r#"
# PIX Commerce API

Online store backend: product catalog, per-user cart, orders and PIX payments.

## Payment flow

1. `POST /api/v1/orders` places an order at current prices. Stock is not touched yet.
2. `POST /api/v1/orders/{id}/payment` creates the PIX charge and returns the QR code.
3. The provider calls `POST /api/v1/payments/webhook` when the payment changes.
   Orders still pending are also checked in the background and on read.
4. On approval stock is decremented exactly once and revenue is recorded.

## Authentication

Customer and admin endpoints take a JWT in the Authorization header:

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

Errors share one body shape:

```json
{
  "error": "Unprocessable Entity",
  "kind": "insufficient_stock",
  "message": "Insufficient stock for product 'Açaí 500ml': available 0, requested 2",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-12-09T10:30:00.000Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Products", description = "Catalog"),
        (name = "Cart", description = "The caller's shopping cart"),
        (name = "Orders", description = "Orders and PIX payment requests"),
        (name = "Payments", description = "Payment provider callbacks"),
        (name = "Admin", description = "Store administration")
    ),
    paths(
        // Products
        crate::handlers::products::list_products,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::update_product,
        crate::handlers::products::delete_product,
        // Cart
        crate::handlers::cart::get_cart,
        crate::handlers::cart::add_item,
        crate::handlers::cart::set_quantity,
        crate::handlers::cart::remove_item,
        crate::handlers::cart::clear_cart,
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::request_payment,
        crate::handlers::orders::cancel_order,
        // Admin
        crate::handlers::admin::list_orders,
        crate::handlers::admin::update_fulfillment,
        crate::handlers::admin::update_payment_status,
        crate::handlers::admin::confirm_payment,
        crate::handlers::admin::simulate_payment,
        crate::handlers::admin::get_revenue,
        crate::handlers::admin::clear_revenue,
        // Webhooks
        crate::handlers::payment_webhooks::payment_webhook,
    ),
    components(
        schemas(
            crate::entities::order::Model,
            crate::entities::order_item::Model,
            crate::entities::product::Model,
            crate::entities::revenue_record::Model,
            crate::entities::PaymentStatus,
            crate::entities::FulfillmentStatus,
            crate::services::orders::OrderWithItems,
            crate::services::cart::CartView,
            crate::services::cart::CartLine,
            crate::services::payment_state::PaymentRequest,
            crate::services::revenue::RevenueSummary,
            crate::handlers::common::TransitionResponse,
            crate::handlers::payment_webhooks::WebhookAck,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
