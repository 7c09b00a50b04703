pub mod admin;
pub mod cart;
pub mod common;
pub mod orders;
pub mod payment_webhooks;
pub mod products;

use crate::{
    auth::AuthService,
    db::DbPool,
    events::EventSender,
    services::{
        cart::CartService, order_locks::OrderLocks, orders::OrderService,
        payment_provider::PaymentProvider, payment_state::PaymentStateMachine,
        products::ProductService, revenue::RevenueRecorder,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub products: ProductService,
    pub cart: CartService,
    pub orders: OrderService,
    pub payments: PaymentStateMachine,
    pub revenue: RevenueRecorder,
    pub auth: Arc<AuthService>,
}

impl AppServices {
    /// Wires every service around one pool and one set of order locks.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        provider: Arc<dyn PaymentProvider>,
        auth: Arc<AuthService>,
    ) -> Self {
        let payments = PaymentStateMachine::new(
            db_pool.clone(),
            OrderLocks::new(),
            provider,
            event_sender.clone(),
        );
        let orders = OrderService::new(db_pool.clone(), payments.clone(), event_sender.clone());

        Self {
            products: ProductService::new(db_pool.clone(), event_sender),
            cart: CartService::new(db_pool.clone()),
            revenue: RevenueRecorder::new(db_pool),
            orders,
            payments,
            auth,
        }
    }
}
