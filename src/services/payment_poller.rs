use crate::{
    errors::ServiceError,
    services::{
        orders::OrderService,
        payment_state::{PaymentStateMachine, UpdateSource},
    },
};
use metrics::counter;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Counts from one polling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub approved: usize,
    pub failed: usize,
}

/// Fallback for lost webhooks: periodically asks the provider about every
/// order still waiting for payment.
pub struct PaymentPoller {
    orders: OrderService,
    payments: PaymentStateMachine,
    interval: Duration,
}

impl PaymentPoller {
    pub fn new(orders: OrderService, payments: PaymentStateMachine, interval: Duration) -> Self {
        Self {
            orders,
            payments,
            interval,
        }
    }

    /// One pass over all awaiting orders. Individual failures are skipped.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PollSummary, ServiceError> {
        let awaiting = self.orders.list_awaiting_payment().await?;
        let mut summary = PollSummary::default();

        for order in awaiting {
            summary.checked += 1;
            match self
                .payments
                .refresh_from_provider(&order, UpdateSource::Poll)
                .await
            {
                Ok(Some(result)) if !result.already_processed() => summary.approved += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(order_id = %order.id, error = %e, "Payment poll failed for order");
                }
            }
        }

        counter!("payment_poll_runs_total", 1);
        if summary.checked > 0 {
            info!(
                checked = summary.checked,
                approved = summary.approved,
                failed = summary.failed,
                "Payment poll finished"
            );
        }
        Ok(summary)
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting payment poller");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Payment poll pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Payment poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}
