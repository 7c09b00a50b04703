mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use common::TestApp;
use pix_commerce_api::{
    auth::Role,
    entities::PaymentStatus,
    handlers::payment_webhooks::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

fn order_body(items: Value) -> Value {
    json!({
        "customer_name": "Maria Silva",
        "customer_phone": "+5511999990000",
        "delivery_address": "Rua das Flores, 10",
        "items": items,
    })
}

fn webhook_request(body: &Value, signature: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((timestamp, signature)) = signature {
        builder = builder
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_and_status_respond() {
    let app = TestApp::new().await;

    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "healthy");

    let (status, body) = app
        .request(Method::GET, "/api/v1/status", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["service"], "pix-commerce-api");
}

#[tokio::test]
async fn catalog_is_public_but_writes_need_admin() {
    let app = TestApp::new().await;
    let product = json!({
        "name": "Açaí 500ml",
        "price": "12.75",
        "stock": 5,
        "category": "bowls",
    });

    let (status, _) = app
        .request(Method::POST, "/api/v1/products", None, Some(product.clone()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let customer = app.token(Uuid::new_v4(), Role::Customer);
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/products",
            Some(&customer),
            Some(product.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");

    let admin = app.admin_token();
    let (status, body) = app
        .request(Method::POST, "/api/v1/products", Some(&admin), Some(product))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .request(Method::GET, "/api/v1/products?category=bowls", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = app
        .request(
            Method::DELETE,
            &format!("/api/v1/products/{id}"),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app
        .request(Method::GET, &format!("/api/v1/products/{id}"), None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn invalid_product_is_rejected() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/products",
            Some(&admin),
            Some(json!({ "name": "", "price": "1.00", "stock": -1, "category": "bowls" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");
}

#[tokio::test]
async fn bad_token_is_unauthorized() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(Method::GET, "/api/v1/cart", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");
}

#[tokio::test]
async fn cart_to_order_over_http() {
    let app = TestApp::new().await;
    let product = app.seed_product("Açaí 500ml", dec!(12.75), 5).await;
    let user = Uuid::new_v4();
    let token = app.token(user, Role::Customer);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(&token),
            Some(json!({ "product_id": product.id, "quantity": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"][0]["quantity"], 2);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&token),
            Some(order_body(json!([]))),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["payment_status"], "pending");
    assert_eq!(body["data"]["status"], "preparing");
    let order_id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = app.request(Method::GET, "/api/v1/cart", Some(&token), None).await;
    assert!(body["data"]["items"].as_array().unwrap().is_empty());

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_id}/payment"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["payment_id"], "pay-1");
    assert!(body["data"]["qr_code"].is_string());

    let stranger = app.token(Uuid::new_v4(), Role::Customer);
    let (status, _) = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_id}"),
            Some(&stranger),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app.request(Method::GET, "/api/v1/orders", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn order_with_bad_quantity_is_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tapioca", dec!(8.00), 5).await;
    let token = app.token(Uuid::new_v4(), Role::Customer);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&token),
            Some(order_body(json!([{ "product_id": product.id, "quantity": 0 }]))),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_approval_decrements_stock_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Açaí 500ml", dec!(12.75), 5).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 2)])
        .await
        .unwrap()
        .order;
    let payload = json!({
        "paymentId": 123456789,
        "status": "approved",
        "orderId": order.id,
    });

    let (status, body) = app.send(webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], true);
    assert_eq!(body["payment_status"], "approved");
    assert_eq!(body["already_processed"], false);

    let (status, body) = app.send(webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_processed"], true);

    assert_eq!(app.stock_of(product.id).await, 3);
    assert_eq!(app.payment_status(order.id).await, PaymentStatus::Approved);
}

#[tokio::test]
async fn webhook_for_unknown_order_is_acknowledged() {
    let app = TestApp::new().await;
    let payload = json!({
        "paymentId": "abc",
        "status": "approved",
        "orderId": Uuid::new_v4(),
    });

    let (status, body) = app.send(webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], false);
    assert_eq!(body["reason"], "order_not_found");
}

#[tokio::test]
async fn webhook_for_another_payment_is_ignored() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tapioca", dec!(8.00), 4).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 1)])
        .await
        .unwrap()
        .order;
    let payment = app
        .services()
        .payments
        .request_payment(order.id)
        .await
        .unwrap();

    let forged = json!({ "paymentId": "999", "status": "approved", "orderId": order.id });
    let (status, body) = app.send(webhook_request(&forged, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], false);
    assert_eq!(body["reason"], "payment_mismatch");
    assert_eq!(app.stock_of(product.id).await, 4);
    assert_eq!(app.payment_status(order.id).await, PaymentStatus::Pending);

    let genuine = json!({
        "paymentId": payment.payment_id,
        "status": "approved",
        "orderId": order.id,
    });
    let (status, body) = app.send(webhook_request(&genuine, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], true);
    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn webhook_without_stock_asks_for_retry() {
    let app = TestApp::new().await;
    let product = app.seed_product("Bolo", dec!(20.00), 1).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 2)])
        .await
        .unwrap()
        .order;
    let payload = json!({ "paymentId": "p-1", "status": "approved", "orderId": order.id });

    let (status, body) = app.send(webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "insufficient_stock");
    assert_eq!(app.payment_status(order.id).await, PaymentStatus::Pending);
}

#[tokio::test]
async fn malformed_webhook_is_bad_request() {
    let app = TestApp::new().await;
    for payload in [
        json!({ "status": "approved", "orderId": Uuid::new_v4() }),
        json!({ "paymentId": "p-1", "orderId": Uuid::new_v4() }),
        json!({ "paymentId": "p-1", "status": "approved", "orderId": "not-a-uuid" }),
    ] {
        let (status, _) = app.send(webhook_request(&payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "payload {payload}");
    }
}

#[tokio::test]
async fn signed_webhooks_are_verified_when_secret_is_set() {
    let secret = "webhook-secret-for-tests";
    let app = TestApp::with_config(|cfg| {
        cfg.payment_webhook_secret = Some(secret.to_string());
    })
    .await;
    let product = app.seed_product("Suco", dec!(6.00), 3).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 1)])
        .await
        .unwrap()
        .order;
    let payload = json!({ "paymentId": "p-9", "status": "approved", "orderId": order.id });
    let raw = payload.to_string();
    let ts = chrono::Utc::now().timestamp().to_string();

    let (status, _) = app.send(webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(webhook_request(&payload, Some((&ts, "deadbeef"))))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.stock_of(product.id).await, 3);

    let signature = sign(secret, &ts, raw.as_bytes()).unwrap();
    let (status, body) = app
        .send(webhook_request(&payload, Some((&ts, &signature))))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], true);
    assert_eq!(app.stock_of(product.id).await, 2);
}

#[tokio::test]
async fn admin_payment_routes() {
    let app = TestApp::new().await;
    let product = app.seed_product("Açaí 1L", dec!(22.00), 4).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 1)])
        .await
        .unwrap()
        .order;
    let admin = app.admin_token();
    let customer = app.token(order.user_id, Role::Customer);

    let (status, _) = app
        .request(
            Method::PATCH,
            &format!("/api/v1/admin/orders/{}/payment", order.id),
            Some(&customer),
            Some(json!({ "status": "approved" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(
            Method::PATCH,
            &format!("/api/v1/admin/orders/{}/payment", order.id),
            Some(&admin),
            Some(json!({ "payment_status": "bogus" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .request(
            Method::PATCH,
            &format!("/api/v1/admin/orders/{}/payment", order.id),
            Some(&admin),
            Some(json!({ "payment_status": "aprovado" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["inventory_mutated"], true);
    assert_eq!(body["data"]["order"]["payment_status"], "approved");

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/admin/orders/{}/confirm-payment", order.id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["already_processed"], true);
    assert_eq!(app.stock_of(product.id).await, 3);

    let (status, body) = app
        .request(Method::GET, "/api/v1/admin/revenue", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["summary"]["record_count"], 1);

    let (status, body) = app
        .request(Method::DELETE, "/api/v1/admin/revenue", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], 1);
}

#[tokio::test]
async fn admin_fulfillment_route_enforces_payment() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cuscuz", dec!(7.00), 4).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 1)])
        .await
        .unwrap()
        .order;
    let admin = app.admin_token();
    let uri = format!("/api/v1/admin/orders/{}/status", order.id);

    let (status, body) = app
        .request(
            Method::PATCH,
            &uri,
            Some(&admin),
            Some(json!({ "status": "saiu_para_entrega" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_transition");

    let (status, body) = app
        .request(
            Method::PATCH,
            &uri,
            Some(&admin),
            Some(json!({ "status": "cancelado" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order"]["status"], "cancelled");
}

#[tokio::test]
async fn simulation_is_hidden_in_production() {
    let app = TestApp::with_config(|cfg| {
        cfg.environment = "production".to_string();
    })
    .await;
    let product = app.seed_product("Café", dec!(4.00), 4).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 1)])
        .await
        .unwrap()
        .order;
    let admin = app.admin_token();

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/v1/admin/orders/{}/simulate-payment", order.id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.stock_of(product.id).await, 4);
}

#[tokio::test]
async fn simulation_approves_outside_production() {
    let app = TestApp::new().await;
    let product = app.seed_product("Café", dec!(4.00), 4).await;
    let order = app
        .place_order(Uuid::new_v4(), &[(product.id, 3)])
        .await
        .unwrap()
        .order;
    let admin = app.admin_token();

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/admin/orders/{}/simulate-payment", order.id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order"]["payment_status"], "approved");
    assert_eq!(app.stock_of(product.id).await, 1);
}
