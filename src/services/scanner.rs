//! Signal scanner
//!
//! Every cycle, scores each watchlist symbol on VWAP, breakout, relative
//! volume, and RSI, then atomically overwrites signals.json with the
//! survivors. Two broker calls per symbol (5-minute and 2-minute bars)
//! keep the scan inside its 67 calls/min budget at the 45-second cadence.

use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::{Config, ScannerConfig};
use crate::indicators;
use crate::services::{et_now, sleep_interruptible, ERROR_SLEEP, MARKET_CLOSED_SLEEP};
use crate::state::StateDir;
use crate::types::{
    Bar, BreakoutRef, DailyWatchlist, EntrySignal, Symbol, Timeframe, WatchlistEntry,
};

/// Bars needed before RSI(14) is meaningful
const MIN_PRIMARY_BARS: usize = 14;

/// Scans the daily watchlist for scored entry signals
pub struct Scanner {
    config: Config,
    state: StateDir,
    broker: Arc<dyn BrokerClient>,
}

/// Raw measurements feeding the scoring rubric
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    pub price: f64,
    pub vwap: f64,
    pub rsi: f64,
    pub breakout_pct: f64,
    pub relative_volume: f64,
    pub gap_pct: Option<f64>,
}

/// Why a symbol failed the required criteria
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    BelowVwap,
    WeakBreakout(f64),
    LowVolume(f64),
    RsiOutOfRange(f64),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::BelowVwap => write!(f, "below_vwap"),
            Rejection::WeakBreakout(pct) => write!(f, "breakout_{:.1}%", pct * 100.0),
            Rejection::LowVolume(rv) => write!(f, "volume_{rv:.1}x"),
            Rejection::RsiOutOfRange(rsi) => write!(f, "rsi_{rsi:.0}"),
        }
    }
}

/// Apply the scoring rubric: four required criteria worth 60 points, four
/// bonus criteria worth up to 35 more. Any required failure rejects.
pub fn score_entry(inputs: &ScoreInputs, cfg: &ScannerConfig) -> Result<u32, Rejection> {
    let mut score = 0u32;

    // Required: price above VWAP (15)
    if inputs.price > inputs.vwap {
        score += 15;
    } else if cfg.require_above_vwap {
        return Err(Rejection::BelowVwap);
    }

    // Required: breakout at least 1% (20)
    if inputs.breakout_pct < cfg.min_breakout_pct {
        return Err(Rejection::WeakBreakout(inputs.breakout_pct));
    }
    score += 20;

    // Required: relative volume at least 2x (15)
    if inputs.relative_volume < cfg.min_relative_volume {
        return Err(Rejection::LowVolume(inputs.relative_volume));
    }
    score += 15;

    // Required: RSI inside [40, 75] inclusive (10)
    if inputs.rsi < cfg.rsi_min || inputs.rsi > cfg.rsi_max {
        return Err(Rejection::RsiOutOfRange(inputs.rsi));
    }
    score += 10;

    // Bonus: strong breakout (10)
    if inputs.breakout_pct >= 0.03 {
        score += 10;
    }
    // Bonus: heavy participation (10)
    if inputs.relative_volume >= 4.0 {
        score += 10;
    }
    // Bonus: RSI sweet spot 50-65 (5)
    if inputs.rsi >= 50.0 && inputs.rsi <= 65.0 {
        score += 5;
    }
    // Bonus: large gap from the watchlist (10)
    if inputs.gap_pct.map(|g| g >= 0.05).unwrap_or(false) {
        score += 10;
    }

    Ok(score)
}

/// Choose the breakout reference in fixed priority order:
/// pre-market high, then session high, then prior close.
pub fn breakout_reference(
    entry: Option<&WatchlistEntry>,
    bars_5min: &[Bar],
) -> Option<(f64, BreakoutRef)> {
    if let Some(e) = entry {
        if e.premarket_high > 0.0 {
            return Some((e.premarket_high, BreakoutRef::PremarketHigh));
        }
    }

    if let Some(high) = indicators::session_high(bars_5min) {
        if high > 0.0 {
            return Some((high, BreakoutRef::SessionHigh));
        }
    }

    if let Some(e) = entry {
        if e.prior_close > 0.0 {
            return Some((e.prior_close, BreakoutRef::PriorClose));
        }
    }

    None
}

/// Ordering for emitted signals: score desc, relative volume desc, time asc
pub fn sort_signals(signals: &mut [EntrySignal]) {
    signals.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(
                b.relative_volume
                    .partial_cmp(&a.relative_volume)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.timestamp.cmp(&b.timestamp))
    });
}

impl Scanner {
    pub fn new(config: Config, state: StateDir, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            config,
            state,
            broker,
        }
    }

    /// Watchlist symbols for today, or the base-universe head in degraded mode
    fn load_universe(&self) -> Result<(Vec<Symbol>, Option<DailyWatchlist>)> {
        let today = et_now().date_naive();

        if let Some(watchlist) = self.state.watchlist().load_for(today)? {
            info!("Loaded daily watchlist: {} symbols", watchlist.entries.len());
            let symbols = watchlist.entries.iter().map(|e| e.symbol.clone()).collect();
            return Ok((symbols, Some(watchlist)));
        }

        warn!("No daily watchlist for {today}; falling back to base-universe head");
        let path = &self.config.universe.universe_path;
        match fs::read_to_string(path) {
            Ok(contents) => {
                let symbols: Vec<Symbol> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .take(self.config.universe.daily_watchlist_size)
                    .map(Symbol::new)
                    .collect();
                Ok((symbols, None))
            }
            Err(e) => {
                error!("Base universe {path} unreadable ({e}); nothing to scan");
                Ok((Vec::new(), None))
            }
        }
    }

    /// Scan one symbol. Exactly two broker calls. Missing or malformed
    /// data skips the symbol with a DEBUG log.
    async fn scan_symbol(
        &self,
        symbol: &Symbol,
        watchlist_entry: Option<&WatchlistEntry>,
    ) -> Result<Option<EntrySignal>> {
        let cfg = &self.config.scanner;

        let bars_5min = self
            .broker
            .get_bars(symbol, Timeframe::FiveMin, cfg.bars_primary)
            .await?;
        let bars_2min = self
            .broker
            .get_bars(symbol, Timeframe::TwoMin, cfg.bars_fast)
            .await?;

        if bars_5min.len() < MIN_PRIMARY_BARS {
            debug!("{symbol}: insufficient 5-minute bars ({})", bars_5min.len());
            return Ok(None);
        }
        if let Some(bad) = bars_5min.iter().find(|b| !b.is_valid()) {
            debug!("{symbol}: malformed bar data ({:?})", bad.validate().err());
            return Ok(None);
        }

        let last = bars_5min.last().unwrap();
        let current_price = last.close;
        let current_volume = last.volume;

        let Some(vwap) = indicators::session_vwap(&bars_5min) else {
            debug!("{symbol}: zero-volume session, no VWAP");
            return Ok(None);
        };

        let closes: Vec<f64> = bars_5min.iter().map(|b| b.close).collect();
        let Some(rsi) = indicators::rsi(&closes, 14).last().copied().flatten() else {
            debug!("{symbol}: RSI not ready");
            return Ok(None);
        };

        let relative_volume = indicators::relative_volume(current_volume, &bars_5min, 20);

        let Some((reference, breakout_ref)) = breakout_reference(watchlist_entry, &bars_5min)
        else {
            debug!("{symbol}: no breakout reference available");
            return Ok(None);
        };
        let breakout_pct = indicators::breakout_pct(current_price, reference);

        let inputs = ScoreInputs {
            price: current_price,
            vwap,
            rsi,
            breakout_pct,
            relative_volume,
            gap_pct: watchlist_entry.map(|e| e.gap_pct),
        };

        let score = match score_entry(&inputs, cfg) {
            Ok(s) => s,
            Err(rejection) => {
                debug!("{symbol} rejected: {rejection}");
                return Ok(None);
            }
        };

        if score < cfg.min_entry_score {
            debug!("{symbol}: score {score} below minimum {}", cfg.min_entry_score);
            return Ok(None);
        }

        let velocity = indicators::velocity(&closes, 5);
        let acceleration = indicators::velocity_ratio(&closes, 5)
            .or_else(|| indicators::acceleration(current_price, &bars_2min, &bars_5min));

        let signal = EntrySignal {
            symbol: symbol.clone(),
            timestamp: Utc::now(),
            price: current_price,
            score,
            vwap,
            rsi,
            breakout_pct,
            breakout_ref,
            relative_volume,
            premarket_high: watchlist_entry.map(|e| e.premarket_high),
            gap_pct: watchlist_entry.map(|e| e.gap_pct),
            velocity,
            acceleration,
        };

        info!(
            "SIGNAL: {symbol} @ ${current_price:.2} | score={score} | rsi={rsi:.0} | \
             breakout={:.1}% ({breakout_ref}) | vol={relative_volume:.1}x",
            breakout_pct * 100.0
        );

        Ok(Some(signal))
    }

    /// One scan cycle: load universe, score every symbol, overwrite signals
    pub async fn run_once(&self) -> Result<()> {
        let (universe, watchlist) = self.load_universe()?;
        if universe.is_empty() {
            return Ok(());
        }

        let mut signals = Vec::new();
        for symbol in &universe {
            let entry = watchlist.as_ref().and_then(|w| w.entry(symbol));
            match self.scan_symbol(symbol, entry).await {
                Ok(Some(signal)) => signals.push(signal),
                Ok(None) => {}
                Err(e) => debug!("{symbol}: scan error ({e})"),
            }
        }

        sort_signals(&mut signals);
        info!("Scan complete: {} signals from {} symbols", signals.len(), universe.len());
        self.state.signals().save(signals)?;
        Ok(())
    }

    /// Continuous scanning loop, market-hours gated
    pub async fn run_continuous(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = std::time::Duration::from_secs(self.config.scanner.interval_seconds);
        info!(
            "Scanner starting: interval={}s, min_score={}",
            interval.as_secs(),
            self.config.scanner.min_entry_score
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.broker.get_clock().await {
                Ok(clock) if clock.is_open => {
                    let cycle_start = std::time::Instant::now();

                    if let Err(e) = self.run_once().await {
                        error!("Scan cycle failed: {e:#}");
                    }
                    self.state.touch_heartbeat("scanner");

                    let elapsed = cycle_start.elapsed();
                    let remaining = interval.saturating_sub(elapsed);
                    debug!(
                        "Cycle took {:.1}s; next scan in {:.0}s",
                        elapsed.as_secs_f64(),
                        remaining.as_secs_f64()
                    );
                    sleep_interruptible(remaining, &shutdown).await;
                }
                Ok(clock) => {
                    debug!("Market closed; next open {}", clock.next_open);
                    self.state.touch_heartbeat("scanner");
                    sleep_interruptible(MARKET_CLOSED_SLEEP, &shutdown).await;
                }
                Err(e) => {
                    warn!("Clock check failed: {e}");
                    sleep_interruptible(ERROR_SLEEP, &shutdown).await;
                }
            }
        }

        info!("Scanner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn inputs() -> ScoreInputs {
        ScoreInputs {
            price: 5.70,
            vwap: 5.55,
            rsi: 58.0,
            breakout_pct: 0.027,
            relative_volume: 3.1,
            gap_pct: None,
        }
    }

    fn cfg() -> ScannerConfig {
        ScannerConfig::default()
    }

    #[test]
    fn test_happy_path_score_65() {
        // 15+20+15+10 required, +5 for the RSI sweet spot
        let score = score_entry(&inputs(), &cfg()).unwrap();
        assert_eq!(score, 65);
    }

    #[test]
    fn test_below_vwap_rejected() {
        let mut i = inputs();
        i.price = 5.50;
        assert_eq!(score_entry(&i, &cfg()), Err(Rejection::BelowVwap));
    }

    #[test]
    fn test_breakout_boundary() {
        let mut i = inputs();
        i.rsi = 45.0; // outside the sweet spot, isolate the breakout points

        i.breakout_pct = 0.0100;
        assert_eq!(score_entry(&i, &cfg()).unwrap(), 60);

        i.breakout_pct = 0.0099;
        assert!(matches!(
            score_entry(&i, &cfg()),
            Err(Rejection::WeakBreakout(_))
        ));
    }

    #[test]
    fn test_rsi_boundaries_inclusive() {
        let mut i = inputs();
        i.rsi = 40.0;
        assert!(score_entry(&i, &cfg()).is_ok());
        i.rsi = 75.0;
        assert!(score_entry(&i, &cfg()).is_ok());
        i.rsi = 39.9;
        assert!(matches!(
            score_entry(&i, &cfg()),
            Err(Rejection::RsiOutOfRange(_))
        ));
        i.rsi = 75.1;
        assert!(matches!(
            score_entry(&i, &cfg()),
            Err(Rejection::RsiOutOfRange(_))
        ));
    }

    #[test]
    fn test_maximum_score_95() {
        let i = ScoreInputs {
            price: 10.0,
            vwap: 9.5,
            rsi: 55.0,
            breakout_pct: 0.05,
            relative_volume: 5.0,
            gap_pct: Some(0.08),
        };
        assert_eq!(score_entry(&i, &cfg()).unwrap(), 95);
    }

    #[test]
    fn test_low_volume_rejected() {
        let mut i = inputs();
        i.relative_volume = 1.9;
        assert!(matches!(score_entry(&i, &cfg()), Err(Rejection::LowVolume(_))));
    }

    fn wl_entry(pm_high: f64, prior_close: f64) -> WatchlistEntry {
        WatchlistEntry {
            symbol: Symbol::new("ABCD"),
            rank: 1,
            prior_close,
            premarket_price: 5.5,
            premarket_high: pm_high,
            premarket_volume: 100_000,
            gap_pct: 0.05,
            relative_volume: 3.0,
            score: 15.0,
        }
    }

    fn bar(high: f64, close: f64) -> Bar {
        Bar {
            datetime: Utc::now(),
            open: close,
            high,
            low: close - 0.1,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_breakout_reference_priority() {
        let bars = vec![bar(5.60, 5.50), bar(5.80, 5.70)];

        // Pre-market high wins when present
        let e = wl_entry(5.55, 5.30);
        let (reference, kind) = breakout_reference(Some(&e), &bars).unwrap();
        assert_eq!(kind, BreakoutRef::PremarketHigh);
        assert!((reference - 5.55).abs() < 1e-9);

        // Zero pre-market high falls through to the session high
        let e = wl_entry(0.0, 5.30);
        let (reference, kind) = breakout_reference(Some(&e), &bars).unwrap();
        assert_eq!(kind, BreakoutRef::SessionHigh);
        assert!((reference - 5.80).abs() < 1e-9);

        // No watchlist entry, no bars: prior close unavailable too
        assert!(breakout_reference(None, &[]).is_none());

        // Empty session falls back to prior close
        let e = wl_entry(0.0, 5.30);
        let (reference, kind) = breakout_reference(Some(&e), &[]).unwrap();
        assert_eq!(kind, BreakoutRef::PriorClose);
        assert!((reference - 5.30).abs() < 1e-9);
    }

    #[test]
    fn test_signal_ordering() {
        let now = Utc::now();
        let make = |score: u32, rv: f64, ts_offset: i64| EntrySignal {
            symbol: Symbol::new("ABCD"),
            timestamp: now + Duration::seconds(ts_offset),
            price: 10.0,
            score,
            vwap: 9.9,
            rsi: 55.0,
            breakout_pct: 0.02,
            breakout_ref: BreakoutRef::SessionHigh,
            relative_volume: rv,
            premarket_high: None,
            gap_pct: None,
            velocity: 0.0,
            acceleration: None,
        };

        let mut signals = vec![make(60, 2.0, 0), make(75, 2.0, 5), make(75, 3.0, 9), make(75, 3.0, 2)];
        sort_signals(&mut signals);

        // Highest score first; ties by rel-vol desc, then earlier timestamp
        assert_eq!(signals[0].score, 75);
        assert!((signals[0].relative_volume - 3.0).abs() < 1e-9);
        assert_eq!(signals[0].timestamp, now + Duration::seconds(2));
        assert_eq!(signals[1].timestamp, now + Duration::seconds(9));
        assert_eq!(signals[2].relative_volume, 2.0);
        assert_eq!(signals[3].score, 60);
    }
}
