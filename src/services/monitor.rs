//! Position monitor
//!
//! Every cycle: reconcile with the broker, ratchet stops (break-even at
//! +5%, then tiered trailing below the peak), and emit sell signals for
//! stop hits, momentum deceleration, and end-of-day liquidation. Stop
//! updates always run before exit checks so a freshly raised trailing
//! stop can fire in the same cycle.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, Clock};
use crate::config::{Config, RiskConfig};
use crate::indicators;
use crate::services::{sleep_interruptible, ERROR_SLEEP, MARKET_CLOSED_SLEEP};
use crate::state::{reconcile_positions, StateDir};
use crate::types::{ExitReason, Position, SellSignal, Symbol, Timeframe};

/// Bars fetched per position for price and acceleration
const ACCEL_BAR_COUNT: usize = 10;

/// Result of applying the risk rules to one position at one price
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub new_peak: f64,
    pub new_stop: f64,
    pub exit: Option<ExitReason>,
}

/// Apply the stop-ratchet and exit rules in their required order:
/// peak update, break-even ratchet, trailing tier, then exit checks.
pub fn evaluate_position(
    position: &Position,
    current_price: f64,
    acceleration: Option<f64>,
    minutes_to_close: i64,
    risk: &RiskConfig,
) -> Evaluation {
    let new_peak = position.peak_price.max(current_price);
    let mut new_stop = position.current_stop;

    let peak_profit = (new_peak - position.entry_price) / position.entry_price;

    // Break-even ratchet: once up 5% at the peak, never give back the entry
    if peak_profit >= risk.breakeven_profit {
        new_stop = new_stop.max(position.entry_price);
    }

    // Tiered trailing stop anchored below the peak
    if let Some(trail) = risk.trailing_pct_for(peak_profit) {
        new_stop = new_stop.max(new_peak * (1.0 - trail));
    }

    // Exit checks run against the freshly ratcheted stop
    let profit = (current_price - position.entry_price) / position.entry_price;

    let exit = if current_price <= new_stop {
        if new_stop < position.entry_price {
            Some(ExitReason::StopLoss)
        } else {
            Some(ExitReason::TrailingStop)
        }
    } else if profit >= risk.min_profit_for_decel_check
        && acceleration.map(|a| a < risk.decel_exit_threshold).unwrap_or(false)
    {
        Some(ExitReason::Deceleration)
    } else if minutes_to_close <= risk.eod_exit_minutes {
        Some(ExitReason::Eod)
    } else {
        None
    };

    Evaluation {
        new_peak,
        new_stop,
        exit,
    }
}

/// Watches open positions and emits exit signals
pub struct Monitor {
    config: Config,
    state: StateDir,
    broker: Arc<dyn BrokerClient>,
}

impl Monitor {
    pub fn new(config: Config, state: StateDir, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            config,
            state,
            broker,
        }
    }

    /// Broker truth wins: drop local entries the broker no longer holds,
    /// adopt broker positions that have no local record.
    async fn reconcile(&self) -> Result<()> {
        let broker_positions = self.broker.list_positions().await?;
        let local = self.state.positions().load()?;
        let before = local.len();
        let reconciled = reconcile_positions(
            local,
            &broker_positions,
            self.config.risk.stop_loss_pct,
            Utc::now(),
        );
        if reconciled.len() != before {
            info!(
                "Reconciled positions: {before} local -> {} (broker holds {})",
                reconciled.len(),
                broker_positions.len()
            );
        }
        self.state.positions().replace(reconciled)?;
        Ok(())
    }

    /// One monitoring cycle over every open position, in symbol order
    pub async fn run_once(&self, clock: &Clock) -> Result<()> {
        self.reconcile().await?;

        let positions = self.state.positions().load()?;
        if positions.is_empty() {
            debug!("No positions to monitor");
            return Ok(());
        }

        info!("Monitoring {} positions", positions.len());
        let pending: Vec<String> = self
            .state
            .sell_signals()
            .load()?
            .iter()
            .map(|s| s.symbol.as_str().to_string())
            .collect();

        let mut exits = Vec::new();
        let now = Utc::now();
        let minutes_to_close = clock.minutes_to_close(now);

        for (key, position) in &positions {
            if pending.contains(key) {
                debug!("{key}: exit already pending");
                continue;
            }

            let symbol = Symbol::new(key.clone());
            let (current_price, acceleration) = match self.observe(&symbol).await {
                Ok(Some(obs)) => obs,
                Ok(None) => {
                    debug!("{key}: no recent bars, skipping this cycle");
                    continue;
                }
                Err(e) => {
                    warn!("{key}: price fetch failed ({e})");
                    continue;
                }
            };

            let eval = evaluate_position(
                position,
                current_price,
                acceleration,
                minutes_to_close,
                &self.config.risk,
            );

            // Persist only genuine increases (monotonic ratchet)
            if eval.new_stop > position.current_stop || eval.new_peak > position.peak_price {
                self.state
                    .positions()
                    .ratchet(key, eval.new_peak, eval.new_stop)?;
                if eval.new_stop > position.current_stop {
                    info!(
                        "{key}: stop raised ${:.2} -> ${:.2} (peak ${:.2})",
                        position.current_stop, eval.new_stop, eval.new_peak
                    );
                }
            }

            let profit_pct = position.unrealized_pct(current_price);
            match eval.exit {
                Some(reason) => {
                    info!(
                        "SELL SIGNAL: {key} @ ${current_price:.2} - {reason} ({:+.1}%)",
                        profit_pct * 100.0
                    );
                    exits.push(SellSignal {
                        symbol: symbol.clone(),
                        timestamp: now,
                        reason,
                        trigger_price: current_price,
                        quantity: position.quantity,
                        entry_price: position.entry_price,
                        entry_time: position.entry_time,
                    });
                }
                None => {
                    debug!(
                        "{key}: ${current_price:.2} ({:+.1}%), stop ${:.2}",
                        profit_pct * 100.0,
                        eval.new_stop
                    );
                }
            }
        }

        if !exits.is_empty() {
            let n = exits.len();
            self.state.sell_signals().append(exits)?;
            info!("Emitted {n} sell signals");
        }

        Ok(())
    }

    /// Latest price and short-horizon acceleration for one symbol.
    /// Two broker calls: 2-minute and 5-minute bars.
    async fn observe(&self, symbol: &Symbol) -> Result<Option<(f64, Option<f64>)>> {
        let bars_2min = self
            .broker
            .get_bars(symbol, Timeframe::TwoMin, ACCEL_BAR_COUNT)
            .await?;
        let bars_5min = self
            .broker
            .get_bars(symbol, Timeframe::FiveMin, ACCEL_BAR_COUNT)
            .await?;

        let Some(last) = bars_2min.last().filter(|b| b.close > 0.0) else {
            return Ok(None);
        };
        let current_price = last.close;
        let acceleration = indicators::acceleration(current_price, &bars_2min, &bars_5min);

        Ok(Some((current_price, acceleration)))
    }

    /// Continuous monitoring loop
    pub async fn run_continuous(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = Duration::from_secs(self.config.monitor.interval_seconds);
        info!(
            "Monitor starting: interval={}s, stop={:.1}%, breakeven at +{:.0}%",
            interval.as_secs(),
            self.config.risk.stop_loss_pct * 100.0,
            self.config.risk.breakeven_profit * 100.0
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.broker.get_clock().await {
                Ok(clock) if clock.is_open => {
                    let cycle_start = std::time::Instant::now();
                    if let Err(e) = self.run_once(&clock).await {
                        error!("Monitor cycle failed: {e:#}");
                    }
                    self.state.touch_heartbeat("monitor");
                    let remaining = interval.saturating_sub(cycle_start.elapsed());
                    sleep_interruptible(remaining, &shutdown).await;
                }
                Ok(_) => {
                    self.state.touch_heartbeat("monitor");
                    sleep_interruptible(MARKET_CLOSED_SLEEP, &shutdown).await;
                }
                Err(e) => {
                    warn!("Clock check failed: {e}");
                    sleep_interruptible(ERROR_SLEEP, &shutdown).await;
                }
            }
        }

        info!("Monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(entry: f64, stop: f64, peak: f64) -> Position {
        Position {
            symbol: Symbol::new("ABCD"),
            entry_price: entry,
            quantity: 100,
            entry_time: Utc::now(),
            current_stop: stop,
            peak_price: peak,
            signal_score: 65,
            signal_price: entry,
            vwap_at_entry: entry,
            rsi_at_entry: 55.0,
            breakout_pct: 0.02,
            slippage_pct: 0.0,
        }
    }

    fn risk() -> RiskConfig {
        RiskConfig::default()
    }

    #[test]
    fn test_breakeven_ratchet_at_five_percent() {
        // Entry 10.00 with stop 9.75; the peak hits 10.50 (+5%)
        let pos = position(10.0, 9.75, 10.0);
        let eval = evaluate_position(&pos, 10.50, None, 120, &risk());

        assert!((eval.new_peak - 10.50).abs() < 1e-9);
        // Break-even puts the stop at entry; the 2% trail off 10.50 gives
        // 10.29, so break-even at 10.29 wins
        assert!((eval.new_stop - 10.29).abs() < 1e-9);
        assert!(eval.exit.is_none());
    }

    #[test]
    fn test_trailing_stop_follows_peak() {
        // Peak reaches 10.80
        let pos = position(10.0, 10.0, 10.50);
        let eval = evaluate_position(&pos, 10.80, None, 120, &risk());
        assert!((eval.new_stop - 10.584).abs() < 1e-9);
        assert!(eval.exit.is_none());

        // Step 3: peak falls back to 10.40: no stop change
        let pos = position(10.0, 10.584, 10.80);
        let eval = evaluate_position(&pos, 10.40, None, 120, &risk());
        assert!((eval.new_stop - 10.584).abs() < 1e-9);
        assert!((eval.new_peak - 10.80).abs() < 1e-9);
        assert!(eval.exit.is_none());

        // Step 4: price touches 10.58: trailing stop fires
        let eval = evaluate_position(&pos, 10.58, None, 120, &risk());
        assert_eq!(eval.exit, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_stop_loss_below_entry() {
        // Entry 8.00, stop 7.80, price prints 7.79
        let pos = position(8.0, 7.80, 8.0);
        let eval = evaluate_position(&pos, 7.79, None, 120, &risk());
        assert_eq!(eval.exit, Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_raise_then_hit_same_cycle() {
        // A trailing raise followed by a price print below the new stop
        // must exit in the same cycle: stop updates precede exit checks.
        let pos = position(10.0, 10.0, 11.0);
        // Peak 11.0 -> 10% tier -> 3% trail -> stop 10.67; price at 10.60
        let eval = evaluate_position(&pos, 10.60, None, 120, &risk());
        assert!((eval.new_stop - 10.67).abs() < 1e-9);
        assert_eq!(eval.exit, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_deceleration_exit() {
        // +8% profit with acceleration 0.25: momentum has faded
        let pos = position(10.0, 10.0, 10.8);
        let eval = evaluate_position(&pos, 10.80, Some(0.25), 120, &risk());
        assert_eq!(eval.exit, Some(ExitReason::Deceleration));
    }

    #[test]
    fn test_deceleration_requires_profit_floor() {
        // Only +2%: momentum fade is not checked
        let pos = position(10.0, 9.75, 10.2);
        let eval = evaluate_position(&pos, 10.20, Some(0.25), 120, &risk());
        assert!(eval.exit.is_none());
    }

    #[test]
    fn test_deceleration_unknown_accel_does_not_exit() {
        let pos = position(10.0, 10.0, 10.8);
        let eval = evaluate_position(&pos, 10.80, None, 120, &risk());
        assert!(eval.exit.is_none());
    }

    #[test]
    fn test_eod_exit() {
        let pos = position(10.0, 9.75, 10.1);
        let eval = evaluate_position(&pos, 10.10, None, 5, &risk());
        assert_eq!(eval.exit, Some(ExitReason::Eod));

        let eval = evaluate_position(&pos, 10.10, None, 6, &risk());
        assert!(eval.exit.is_none());
    }

    #[test]
    fn test_stop_never_decreases() {
        // Deep trailing stop already set; shallow peak must not lower it
        let pos = position(10.0, 10.584, 10.8);
        let eval = evaluate_position(&pos, 10.70, None, 120, &risk());
        assert!(eval.new_stop >= 10.584);
    }

    #[test]
    fn test_stop_floor_invariant() {
        // current_stop >= entry * (1 - stop_loss_pct) always holds
        let pos = position(10.0, 9.75, 10.0);
        let eval = evaluate_position(&pos, 9.90, None, 120, &risk());
        assert!(eval.new_stop >= 10.0 * (1.0 - risk().stop_loss_pct) - 1e-9);
    }
}
