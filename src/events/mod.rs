use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{FulfillmentStatus, PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes after a commit. The state change already happened, so a
    /// closed channel is logged and otherwise ignored.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            counter!("events_dropped_total", 1, "event" => name);
            warn!(event = name, error = %e, "Dropping domain event");
        }
    }
}

/// Domain events published once the owning transaction has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
    },
    PaymentRequested {
        order_id: Uuid,
        payment_id: String,
    },
    PaymentApproved {
        order_id: Uuid,
        payment_id: Option<String>,
    },
    PaymentStatusChanged {
        order_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        stock_restored: bool,
    },
    InventoryDecremented {
        order_id: Uuid,
        lines: usize,
    },
    InventoryRestored {
        order_id: Uuid,
        lines: usize,
    },
    RevenueRecorded {
        order_id: Uuid,
        amount: Decimal,
        recorded_at: DateTime<Utc>,
    },
    FulfillmentChanged {
        order_id: Uuid,
        old_status: FulfillmentStatus,
        new_status: FulfillmentStatus,
    },
    ProductArchived {
        product_id: Uuid,
        carts_cleared: u64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::PaymentRequested { .. } => "payment_requested",
            Event::PaymentApproved { .. } => "payment_approved",
            Event::PaymentStatusChanged { .. } => "payment_status_changed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::InventoryDecremented { .. } => "inventory_decremented",
            Event::InventoryRestored { .. } => "inventory_restored",
            Event::RevenueRecorded { .. } => "revenue_recorded",
            Event::FulfillmentChanged { .. } => "fulfillment_changed",
            Event::ProductArchived { .. } => "product_archived",
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("events_processed_total", 1, "event" => event.name());
        match &event {
            Event::OrderCreated {
                order_id,
                user_id,
                total,
            } => info!(%order_id, %user_id, %total, "order created"),
            Event::PaymentRequested {
                order_id,
                payment_id,
            } => info!(%order_id, payment_id = %payment_id, "PIX payment requested"),
            Event::PaymentApproved {
                order_id,
                payment_id,
            } => info!(%order_id, payment_id = ?payment_id, "payment approved"),
            Event::PaymentStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "payment status changed"),
            Event::OrderCancelled {
                order_id,
                stock_restored,
            } => info!(%order_id, stock_restored, "order cancelled"),
            Event::InventoryDecremented { order_id, lines } => {
                info!(%order_id, lines, "inventory decremented")
            }
            Event::InventoryRestored { order_id, lines } => {
                info!(%order_id, lines, "inventory restored")
            }
            Event::RevenueRecorded {
                order_id,
                amount,
                recorded_at,
            } => info!(%order_id, %amount, %recorded_at, "revenue recorded"),
            Event::FulfillmentChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "fulfillment status changed"),
            Event::ProductArchived {
                product_id,
                carts_cleared,
            } => info!(%product_id, carts_cleared, "product archived"),
        }
    }

    info!("Event channel closed, stopping event processing loop");
}
