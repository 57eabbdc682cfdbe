//! Buyer service
//!
//! Consumes fresh entry signals, revalidates the live quote against
//! slippage and spread limits, sizes the position by score tier, and
//! submits day limit orders. A 5-second fast path handles signals scoring
//! 90 or higher between the regular 15-second passes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, OrderRequest, OrderSide};
use crate::config::{BuyerConfig, Config};
use crate::orders::{position_quantity, round_to_cents, OrderExecutor, OrderOutcome};
use crate::services::{sleep_interruptible, ERROR_SLEEP, MARKET_CLOSED_SLEEP};
use crate::state::{reconcile_positions, StateDir};
use crate::types::{EntrySignal, Position, Quote, ScoreTier};

/// Keep processed-signal markers at least this long
const SEEN_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Executes validated buy orders from scanner signals
pub struct Buyer {
    config: Config,
    state: StateDir,
    broker: Arc<dyn BrokerClient>,
    executor: OrderExecutor,
    /// Processed (symbol, signal timestamp) pairs; re-seen signals are ignored
    seen: HashMap<(String, DateTime<Utc>), Instant>,
}

/// Quote-validation outcome: the accepted mid price or a rejection tag
pub fn validate_quote(quote: &Quote, signal_price: f64, cfg: &BuyerConfig) -> Result<f64, String> {
    if !quote.is_usable() {
        return Err("invalid_quote".to_string());
    }

    let mid = quote.mid();
    let spread = quote.spread_pct();
    if spread > cfg.max_spread_pct {
        return Err(format!("spread_{:.1}%", spread * 100.0));
    }

    let slippage = (mid - signal_price) / signal_price;
    if slippage > cfg.max_slippage_pct {
        return Err(format!("slippage_{:.1}%", slippage * 100.0));
    }
    if slippage < -cfg.max_reversal_pct {
        return Err(format!("reversal_{:.1}%", slippage * 100.0));
    }

    Ok(mid)
}

/// Equity fraction for a score tier
pub fn size_pct_for(score: u32, cfg: &BuyerConfig) -> f64 {
    match ScoreTier::from_score(score) {
        ScoreTier::Standard => cfg.size_standard_pct,
        ScoreTier::Strong => cfg.size_strong_pct,
        ScoreTier::Maximum => cfg.size_maximum_pct,
    }
}

impl Buyer {
    pub fn new(config: Config, state: StateDir, broker: Arc<dyn BrokerClient>) -> Self {
        let executor = OrderExecutor::new(broker.clone());
        Self {
            config,
            state,
            broker,
            executor,
            seen: HashMap::new(),
        }
    }

    /// Reconcile the local position map with the broker before trading.
    /// Recovers positions from a crash between fill and state write.
    pub async fn reconcile_on_startup(&self) -> Result<()> {
        let broker_positions = self.broker.list_positions().await?;
        let local = self.state.positions().load()?;
        let reconciled = reconcile_positions(
            local,
            &broker_positions,
            self.config.risk.stop_loss_pct,
            Utc::now(),
        );
        info!("Startup reconciliation: {} open positions", reconciled.len());
        self.state.positions().replace(reconciled)?;
        Ok(())
    }

    fn mark_seen(&mut self, signal: &EntrySignal) {
        self.seen.insert(
            (signal.symbol.as_str().to_string(), signal.timestamp),
            Instant::now(),
        );
        self.seen.retain(|_, t| t.elapsed() < SEEN_RETENTION);
    }

    fn already_seen(&self, signal: &EntrySignal) -> bool {
        self.seen
            .contains_key(&(signal.symbol.as_str().to_string(), signal.timestamp))
    }

    /// Process signals at or above `min_score` (None = all fresh signals)
    pub async fn process_signals(&mut self, min_score: Option<u32>) -> Result<()> {
        let now = Utc::now();
        let cfg = self.config.buyer.clone();

        let mut signals = self
            .state
            .signals()
            .load_fresh(now, cfg.signal_max_age_seconds)?;
        if let Some(min) = min_score {
            signals.retain(|s| s.score >= min);
        }
        signals.retain(|s| !self.already_seen(s));
        if signals.is_empty() {
            return Ok(());
        }

        // Score order; ties resolved by earlier timestamp
        signals.sort_by(|a, b| b.score.cmp(&a.score).then(a.timestamp.cmp(&b.timestamp)));

        let mut positions = self.state.positions().load()?;
        debug!(
            "Processing {} signals ({} positions open)",
            signals.len(),
            positions.len()
        );

        for signal in signals {
            let symbol = signal.symbol.as_str().to_string();

            if positions.contains_key(&symbol) {
                debug!("{symbol}: already holding, skipping");
                continue;
            }

            if self.state.cooldowns().is_active(&symbol, Utc::now())? {
                debug!("{symbol}: in cooldown, skipping");
                continue;
            }

            if positions.len() >= cfg.max_positions {
                info!(
                    "At max positions ({}/{}); no more buys this cycle",
                    positions.len(),
                    cfg.max_positions
                );
                break;
            }

            // A signal that is about to expire mid-processing must not fire
            if !signal.is_fresh(Utc::now(), cfg.signal_max_age_seconds) {
                debug!("{symbol}: signal expired while queued");
                continue;
            }

            match self.try_buy(&signal).await {
                Ok(Some(position)) => {
                    positions.insert(symbol, position);
                }
                Ok(None) => {}
                Err(e) => warn!("{symbol}: buy attempt failed ({e:#})"),
            }
        }

        Ok(())
    }

    /// Validate, size, submit, and persist one entry. `Ok(None)` means the
    /// signal was skipped or the order did not fill.
    async fn try_buy(&mut self, signal: &EntrySignal) -> Result<Option<Position>> {
        let cfg = &self.config.buyer;
        let symbol = &signal.symbol;

        let quote = self.broker.get_latest_quote(symbol).await?;
        let mid = match validate_quote(&quote, signal.price, cfg) {
            Ok(mid) => mid,
            Err(reason) => {
                info!("{symbol} skipped: {reason}");
                return Ok(None);
            }
        };

        let account = self.broker.get_account().await?;
        let size_pct = size_pct_for(signal.score, cfg);
        let quantity = position_quantity(account.equity, size_pct, mid);
        if quantity <= 0 {
            warn!("{symbol}: sized to zero shares at ${mid:.2}");
            return Ok(None);
        }

        let tier = ScoreTier::from_score(signal.score);
        let request = if cfg.use_limit_orders {
            let limit_price = round_to_cents(mid * (1.0 + cfg.limit_order_buffer));
            info!(
                "BUYING {symbol}: score={} ({tier}) signal=${:.2} mid=${mid:.2} limit=${limit_price:.2} qty={quantity} ({:.0}%)",
                signal.score,
                signal.price,
                size_pct * 100.0
            );
            OrderRequest::limit(symbol.clone(), quantity, OrderSide::Buy, limit_price)
        } else {
            info!(
                "BUYING {symbol}: score={} ({tier}) mid=${mid:.2} qty={quantity} ({:.0}%)",
                signal.score,
                size_pct * 100.0
            );
            OrderRequest::market(symbol.clone(), quantity, OrderSide::Buy)
        };

        // The order counts as processed whether or not it fills
        self.mark_seen(signal);

        match self.executor.submit_and_wait(&request).await {
            Ok(OrderOutcome::Filled(fill)) => {
                let stop = fill.price * (1.0 - self.config.risk.stop_loss_pct);
                info!(
                    "FILLED {symbol} {} @ ${:.2}, stop ${stop:.2}",
                    fill.quantity, fill.price
                );

                let position = Position {
                    symbol: symbol.clone(),
                    entry_price: fill.price,
                    quantity: fill.quantity,
                    entry_time: Utc::now(),
                    current_stop: stop,
                    peak_price: fill.price,
                    signal_score: signal.score,
                    signal_price: signal.price,
                    vwap_at_entry: signal.vwap,
                    rsi_at_entry: signal.rsi,
                    breakout_pct: signal.breakout_pct,
                    slippage_pct: (fill.price - signal.price) / signal.price,
                };
                self.state.positions().insert(position.clone())?;
                Ok(Some(position))
            }
            Ok(OrderOutcome::NotFilled { reason }) => {
                warn!("{symbol}: order not filled ({reason})");
                Ok(None)
            }
            Err(e) => {
                warn!("{symbol}: order error ({e})");
                Ok(None)
            }
        }
    }

    /// Continuous loop: hot-path check every 5s, full pass every 15s
    pub async fn run_continuous(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let cfg = self.config.buyer.clone();
        let hot_interval = Duration::from_secs(cfg.hot_check_interval_seconds);
        let regular_interval = Duration::from_secs(cfg.interval_seconds);

        info!(
            "Buyer starting: interval={}s, hot-path={}s (score>={}), max positions={}",
            cfg.interval_seconds,
            cfg.hot_check_interval_seconds,
            cfg.hot_signal_min_score,
            cfg.max_positions
        );

        if let Err(e) = self.reconcile_on_startup().await {
            warn!("Startup reconciliation failed: {e:#}");
        }

        let mut last_regular: Option<Instant> = None;

        while !shutdown.load(Ordering::Relaxed) {
            match self.broker.get_clock().await {
                Ok(clock) if clock.is_open => {
                    // Fast path: highest-score signals only
                    if let Err(e) = self.process_signals(Some(cfg.hot_signal_min_score)).await {
                        error!("Hot-path pass failed: {e:#}");
                    }

                    let regular_due = last_regular
                        .map(|t| t.elapsed() >= regular_interval)
                        .unwrap_or(true);
                    if regular_due {
                        if let Err(e) = self.process_signals(None).await {
                            error!("Signal pass failed: {e:#}");
                        }
                        last_regular = Some(Instant::now());
                    }

                    self.state.touch_heartbeat("buyer");
                    sleep_interruptible(hot_interval, &shutdown).await;
                }
                Ok(_) => {
                    self.state.touch_heartbeat("buyer");
                    sleep_interruptible(MARKET_CLOSED_SLEEP, &shutdown).await;
                }
                Err(e) => {
                    warn!("Clock check failed: {e}");
                    sleep_interruptible(ERROR_SLEEP, &shutdown).await;
                }
            }
        }

        info!("Buyer stopped");
        Ok(())
    }
}
