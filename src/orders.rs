//! Order execution with polling
//!
//! Submits an order and polls its status once a second up to a hard cap,
//! instead of sleeping and hoping. Partial fills at timeout become the
//! position; everything else is canceled cleanly.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::broker::{BrokerClient, OrderRequest, OrderStatus};
use crate::error::BrokerError;

/// A fill produced by [`OrderExecutor::submit_and_wait`]
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub quantity: i64,
    pub price: f64,
    /// True when only part of the requested quantity filled before timeout
    pub partial: bool,
}

/// Outcome of one order attempt
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Filled(Fill),
    NotFilled { reason: String },
}

impl OrderOutcome {
    pub fn fill(&self) -> Option<&Fill> {
        match self {
            OrderOutcome::Filled(f) => Some(f),
            OrderOutcome::NotFilled { .. } => None,
        }
    }
}

/// Submits orders and tracks them to a terminal state
#[derive(Clone)]
pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    pub fn with_timing(broker: Arc<dyn BrokerClient>, poll: Duration, max_wait: Duration) -> Self {
        Self {
            broker,
            poll_interval: poll,
            max_wait,
        }
    }

    /// Submit and poll until filled, dead, or timed out.
    ///
    /// Submission failures surface as `Err`; an order that reached the
    /// broker but did not fill comes back as `Ok(NotFilled)`.
    pub async fn submit_and_wait(&self, request: &OrderRequest) -> Result<OrderOutcome, BrokerError> {
        info!(
            "Submitting {} order: {} {} @ {:?}",
            request.side, request.qty, request.symbol, request.order_type
        );

        let submitted = self.broker.submit_order(request).await?;
        let order_id = submitted.id.clone();

        if submitted.status == OrderStatus::Filled {
            return Ok(self.report_fill(&order_id, submitted.filled_qty, submitted.filled_avg_price, false));
        }
        if submitted.status.is_dead() {
            return Ok(OrderOutcome::NotFilled {
                reason: format!("order {:?} on submit", submitted.status),
            });
        }

        let deadline = Instant::now() + self.max_wait;
        let mut polls = 0u32;

        while Instant::now() < deadline {
            sleep(self.poll_interval).await;
            polls += 1;

            let report = self.broker.get_order(&order_id).await?;

            match report.status {
                OrderStatus::Filled => {
                    info!(
                        "Order FILLED: {} {} after {} polls",
                        request.symbol, report.filled_qty, polls
                    );
                    return Ok(self.report_fill(
                        &order_id,
                        report.filled_qty,
                        report.filled_avg_price,
                        false,
                    ));
                }
                s if s.is_dead() => {
                    warn!("Order {:?}: {} ({})", s, request.symbol, order_id);
                    return Ok(OrderOutcome::NotFilled {
                        reason: format!("order {s:?}"),
                    });
                }
                OrderStatus::PartiallyFilled => {
                    info!(
                        "Partial fill: {}/{} for {}",
                        report.filled_qty, request.qty, request.symbol
                    );
                }
                _ => {}
            }
        }

        // Timeout: cancel the remainder, keep whatever filled
        warn!(
            "Order timeout after {}s: {} ({})",
            self.max_wait.as_secs(),
            request.symbol,
            order_id
        );
        if let Err(e) = self.broker.cancel_order(&order_id).await {
            warn!("Failed to cancel timed-out order {order_id}: {e}");
        }

        let report = self.broker.get_order(&order_id).await?;
        if report.filled_qty > 0 {
            return Ok(self.report_fill(&order_id, report.filled_qty, report.filled_avg_price, true));
        }

        Ok(OrderOutcome::NotFilled {
            reason: format!("no fill within {}s", self.max_wait.as_secs()),
        })
    }

    fn report_fill(
        &self,
        order_id: &str,
        qty: i64,
        avg_price: Option<f64>,
        partial: bool,
    ) -> OrderOutcome {
        match avg_price {
            Some(price) if qty > 0 => OrderOutcome::Filled(Fill {
                order_id: order_id.to_string(),
                quantity: qty,
                price,
                partial,
            }),
            _ => OrderOutcome::NotFilled {
                reason: "fill reported without price/quantity".to_string(),
            },
        }
    }
}

/// Shares to buy for a given slice of equity at a given price
pub fn position_quantity(equity: f64, size_pct: f64, price: f64) -> i64 {
    if price <= 0.0 {
        return 0;
    }
    (equity * size_pct / price).floor() as i64
}

/// Round a price to cents, the exchange tick for these symbols
pub fn round_to_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
