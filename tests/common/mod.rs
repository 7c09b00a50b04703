#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use dashmap::DashMap;
use pix_commerce_api::{
    app_router,
    auth::{AuthService, Role},
    config::AppConfig,
    db,
    entities::{order, product, PaymentStatus},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        orders::{OrderDraft, OrderLineDraft, OrderWithItems},
        payment_provider::{ExternalPaymentStatus, PaymentProvider, PixPayment},
        products::CreateProductRequest,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::EntityTrait;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// In-process stand-in for the PIX provider. Payment ids are sequential;
/// statuses default to `pending` until set with [`StubProvider::set_status`].
#[derive(Default)]
pub struct StubProvider {
    next_id: AtomicUsize,
    statuses: DashMap<String, String>,
    pub create_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
}

impl StubProvider {
    pub fn set_status(&self, payment_id: &str, status: &str) {
        self.statuses
            .insert(payment_id.to_string(), status.to_string());
    }

    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for StubProvider {
    async fn create_payment(
        &self,
        _amount: Decimal,
        _description: String,
    ) -> Result<PixPayment, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::ProviderUnavailable("stub is down".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PixPayment {
            id: format!("pay-{n}"),
            qr_code: format!("00020126580014br.gov.bcb.pix-{n}"),
            qr_code_base64: Some("iVBORw0KGgo=".into()),
        })
    }

    async fn get_payment_status(
        &self,
        payment_id: String,
    ) -> Result<ExternalPaymentStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::ProviderUnavailable("stub is down".into()));
        }
        let status = self
            .statuses
            .get(&payment_id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| "pending".to_string());
        Ok(ExternalPaymentStatus::from_provider(&status))
    }
}

/// Application state over a fresh in-memory SQLite database.
pub struct TestApp {
    pub state: AppState,
    pub provider: Arc<StubProvider>,
    pub auth: Arc<AuthService>,
    router: Router,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let provider = Arc::new(StubProvider::default());
        let auth = Arc::new(AuthService::new(&cfg.jwt_secret, cfg.jwt_expiration));
        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            provider.clone(),
            auth.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };

        Self {
            router: app_router(state.clone()),
            state,
            provider,
            auth,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub fn token(&self, user_id: Uuid, role: Role) -> String {
        self.auth
            .issue_token(user_id, role)
            .expect("issue test token")
    }

    pub fn admin_token(&self) -> String {
        self.token(Uuid::new_v4(), Role::Admin)
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.services()
            .products
            .create(CreateProductRequest {
                name: name.to_string(),
                description: None,
                price,
                stock,
                category: "bowls".to_string(),
                image_url: None,
            })
            .await
            .expect("seed product")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .stock
    }

    pub async fn place_order(
        &self,
        user_id: Uuid,
        lines: &[(Uuid, i32)],
    ) -> Result<OrderWithItems, ServiceError> {
        self.services()
            .orders
            .create(OrderDraft {
                user_id,
                customer_name: "Maria Silva".to_string(),
                customer_phone: "+5511999990000".to_string(),
                delivery_address: "Rua das Flores, 10".to_string(),
                payment_method: "pix".to_string(),
                items: lines
                    .iter()
                    .map(|&(product_id, quantity)| OrderLineDraft {
                        product_id,
                        quantity,
                    })
                    .collect(),
            })
            .await
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn payment_status(&self, order_id: Uuid) -> PaymentStatus {
        self.order(order_id).await.payment_status
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }
}
