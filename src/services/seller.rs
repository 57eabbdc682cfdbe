//! Seller service
//!
//! Drains the sell-signal queue in arrival order: market-sell the full
//! broker quantity, append the trade record, drop the position, and start
//! the symbol's cooldown. A signal whose broker quantity is already zero
//! is dropped, which makes duplicate exits harmless.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, OrderRequest, OrderSide};
use crate::config::Config;
use crate::orders::OrderExecutor;
use crate::services::{sleep_interruptible, ERROR_SLEEP, MARKET_CLOSED_SLEEP};
use crate::state::StateDir;
use crate::types::{SellSignal, TradeRecord};

/// Consecutive failures on one symbol before escalating to ERROR
const FAILURE_ESCALATION: u32 = 3;

/// Executes exits and finalizes trade bookkeeping
pub struct Seller {
    config: Config,
    state: StateDir,
    broker: Arc<dyn BrokerClient>,
    executor: OrderExecutor,
    /// Consecutive non-fill count per symbol
    failures: HashMap<String, u32>,
}

impl Seller {
    pub fn new(config: Config, state: StateDir, broker: Arc<dyn BrokerClient>) -> Self {
        let executor = OrderExecutor::new(broker.clone());
        Self {
            config,
            state,
            broker,
            executor,
            failures: HashMap::new(),
        }
    }

    /// One pass over the pending sell signals, FIFO
    pub async fn run_once(&mut self) -> Result<()> {
        let now = Utc::now();
        let signals = self.state.sell_signals().load()?;
        if signals.is_empty() {
            return Ok(());
        }

        let max_age = ChronoDuration::minutes(self.config.seller.signal_max_age_minutes);
        let (fresh, stale): (Vec<_>, Vec<_>) =
            signals.into_iter().partition(|s| now - s.timestamp <= max_age);
        if !stale.is_empty() {
            warn!("Dropping {} stale sell signals", stale.len());
        }
        if fresh.is_empty() {
            self.state.sell_signals().replace(Vec::new())?;
            return Ok(());
        }

        info!("Processing {} sell signals", fresh.len());

        // One positions call covers the whole pass
        let broker_positions = self.broker.list_positions().await?;
        let mut held: HashMap<String, i64> = broker_positions
            .into_iter()
            .map(|p| (p.symbol.as_str().to_string(), p.qty))
            .collect();

        let mut remaining = Vec::new();
        for signal in fresh {
            let key = signal.symbol.as_str().to_string();
            let qty = held.get(&key).copied().unwrap_or(0);

            if qty <= 0 {
                debug!("{key}: already flat at broker; dropping signal");
                self.failures.remove(&key);
                // The local record may still linger after a crash
                self.state.positions().remove(&key)?;
                continue;
            }

            match self.execute_exit(&signal, qty).await {
                Ok(true) => {
                    self.failures.remove(&key);
                    // A later duplicate in this same pass must see us flat
                    held.remove(&key);
                }
                Ok(false) => {
                    let count = self.failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count >= FAILURE_ESCALATION {
                        error!("{key}: exit failed {count} consecutive times");
                    } else {
                        warn!("{key}: exit not filled (attempt {count}); will retry");
                    }
                    remaining.push(signal);
                }
                Err(e) => {
                    warn!("{key}: exit error ({e:#}); will retry");
                    remaining.push(signal);
                }
            }
        }

        // Processed entries are cleared; unfilled ones stay for next cycle
        self.state.sell_signals().replace(remaining)?;
        Ok(())
    }

    /// Market-sell the full quantity and finalize bookkeeping on fill
    async fn execute_exit(&mut self, signal: &SellSignal, qty: i64) -> Result<bool> {
        let symbol = &signal.symbol;
        info!(
            "SELLING {symbol}: {qty} shares, reason {} (trigger ${:.2})",
            signal.reason, signal.trigger_price
        );

        let request = OrderRequest::market(symbol.clone(), qty, OrderSide::Sell);
        let outcome = self.executor.submit_and_wait(&request).await?;

        let Some(fill) = outcome.fill() else {
            return Ok(false);
        };

        let exit_time = Utc::now();
        let pnl_pct = (fill.price - signal.entry_price) / signal.entry_price;
        let pnl_dollars = (fill.price - signal.entry_price) * fill.quantity as f64;
        let hold_time_hours =
            (exit_time - signal.entry_time).num_seconds() as f64 / 3600.0;

        info!(
            "SOLD {symbol} {} @ ${:.2} | entry ${:.2} | P&L ${:.2} ({:+.1}%)",
            fill.quantity,
            fill.price,
            signal.entry_price,
            pnl_dollars,
            pnl_pct * 100.0
        );

        // Signal score travels from the position record into the trade log
        let signal_score = self
            .state
            .positions()
            .load()?
            .get(symbol.as_str())
            .map(|p| p.signal_score)
            .unwrap_or(0);

        self.state.trades().append(TradeRecord {
            symbol: symbol.clone(),
            entry_time: signal.entry_time,
            exit_time,
            entry_price: signal.entry_price,
            exit_price: fill.price,
            quantity: fill.quantity,
            pnl_pct,
            pnl_dollars,
            hold_time_hours,
            reason: signal.reason,
            signal_score,
        })?;

        self.state.positions().remove(symbol.as_str())?;

        let cooldown_until =
            exit_time + ChronoDuration::minutes(self.config.seller.cooldown_minutes);
        self.state.cooldowns().set(symbol.as_str(), cooldown_until)?;
        debug!("{symbol}: cooldown until {cooldown_until}");

        Ok(true)
    }

    /// Continuous loop; pending signals are reprocessed on startup
    pub async fn run_continuous(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = Duration::from_secs(self.config.seller.interval_seconds);
        info!(
            "Seller starting: interval={}s, cooldown={}min",
            interval.as_secs(),
            self.config.seller.cooldown_minutes
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.broker.get_clock().await {
                Ok(clock) if clock.is_open => {
                    if let Err(e) = self.run_once().await {
                        error!("Sell pass failed: {e:#}");
                    }
                    self.state.touch_heartbeat("seller");
                    sleep_interruptible(interval, &shutdown).await;
                }
                Ok(_) => {
                    self.state.touch_heartbeat("seller");
                    sleep_interruptible(MARKET_CLOSED_SLEEP, &shutdown).await;
                }
                Err(e) => {
                    warn!("Clock check failed: {e}");
                    sleep_interruptible(ERROR_SLEEP, &shutdown).await;
                }
            }
        }

        info!("Seller stopped");
        Ok(())
    }
}
