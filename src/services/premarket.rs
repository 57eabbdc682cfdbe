//! Pre-market scanner
//!
//! Builds the day's watchlist of top gappers before the open. Runs once
//! per invocation; the orchestrator schedules it inside the 08:00-09:25 ET
//! window. Selection: price band, minimum gap, minimum pre-market volume,
//! minimum normalized relative volume, then rank by gap x relative volume.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::services::et_now;
use crate::state::StateDir;
use crate::types::{Bar, DailyWatchlist, Symbol, Timeframe, WatchlistEntry};

/// Pre-market session is ~5.5h (04:00-09:30); a regular session is 6.5h.
/// Scales pre-market volume to a full-day equivalent before comparing.
const SESSION_NORMALIZATION: f64 = 6.5 / 5.5;

/// Builds the daily watchlist of top pre-market gappers
pub struct PreMarketScanner {
    config: Config,
    state: StateDir,
    broker: Arc<dyn BrokerClient>,
}

/// One symbol's raw pre-market observations
#[derive(Debug, Clone)]
struct PremarketData {
    price: f64,
    volume: u64,
    high: f64,
}

impl PreMarketScanner {
    pub fn new(config: Config, state: StateDir, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            config,
            state,
            broker,
        }
    }

    /// Build (or return) today's watchlist. With `force`, an existing
    /// watchlist for today is rebuilt; otherwise it is returned as-is so
    /// the list is refreshed at most once per trading date.
    pub async fn run(&self, force: bool) -> Result<DailyWatchlist> {
        let today = et_now().date_naive();

        if !force {
            if let Some(existing) = self.state.watchlist().load_for(today)? {
                info!(
                    "Watchlist for {today} already exists ({} symbols); skipping rescan",
                    existing.entries.len()
                );
                return Ok(existing);
            }
        }

        let universe = self.load_base_universe()?;
        info!(
            "Pre-market scan of {} symbols (gap>{:.0}%, pm_vol>{}, rel_vol>{:.1}x, ${:.0}-${:.0})",
            universe.len(),
            self.config.universe.min_gap_pct * 100.0,
            self.config.universe.min_premarket_volume,
            self.config.universe.min_premarket_rel_volume,
            self.config.universe.price_min,
            self.config.universe.price_max,
        );

        let mut candidates = Vec::new();
        for (i, symbol) in universe.iter().enumerate() {
            if i % 50 == 0 && i > 0 {
                info!(
                    "  scan progress: {i}/{} | {} candidates",
                    universe.len(),
                    candidates.len()
                );
            }

            match self.scan_symbol(symbol).await {
                Ok(Some(entry)) => {
                    info!(
                        "  + {}: gap={:.1}% rel_vol={:.1}x score={:.1}",
                        symbol,
                        entry.gap_pct * 100.0,
                        entry.relative_volume,
                        entry.score
                    );
                    candidates.push(entry);
                }
                Ok(None) => {}
                Err(e) => debug!("  {symbol}: skipped ({e})"),
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(self.config.universe.daily_watchlist_size);
        for (i, entry) in candidates.iter_mut().enumerate() {
            entry.rank = (i + 1) as u32;
        }

        let watchlist = DailyWatchlist {
            date: today,
            generated_at: Utc::now(),
            entries: candidates,
        };

        if watchlist.entries.is_empty() {
            error!("Pre-market scan produced no candidates; watchlist not written");
            return Ok(watchlist);
        }

        self.state.watchlist().save(&watchlist)?;
        info!(
            "Daily watchlist saved: {} symbols, top: {}",
            watchlist.entries.len(),
            watchlist
                .entries
                .first()
                .map(|e| e.symbol.as_str())
                .unwrap_or("-")
        );
        Ok(watchlist)
    }

    fn load_base_universe(&self) -> Result<Vec<Symbol>> {
        let path = &self.config.universe.universe_path;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read base universe {path}"))?;

        let symbols: Vec<Symbol> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(self.config.universe.base_universe_size)
            .map(Symbol::new)
            .collect();

        if symbols.is_empty() {
            anyhow::bail!("base universe file {path} is empty");
        }
        Ok(symbols)
    }

    /// Evaluate one symbol against the pre-market filters.
    /// Per-symbol failures are logged and skipped; the scan proceeds.
    async fn scan_symbol(&self, symbol: &Symbol) -> Result<Option<WatchlistEntry>> {
        let Some(prior_close) = self.prior_close(symbol).await? else {
            return Ok(None);
        };

        let Some(pm) = self.premarket_data(symbol).await? else {
            return Ok(None);
        };

        let u = &self.config.universe;

        if pm.price < u.price_min || pm.price > u.price_max {
            return Ok(None);
        }

        let gap_pct = (pm.price - prior_close) / prior_close;
        if gap_pct < u.min_gap_pct {
            return Ok(None);
        }

        if pm.volume < u.min_premarket_volume {
            return Ok(None);
        }

        let avg_daily_volume = self.average_daily_volume(symbol).await?;
        let relative_volume = if avg_daily_volume > 0.0 {
            pm.volume as f64 * SESSION_NORMALIZATION / avg_daily_volume
        } else {
            1.0
        };
        if relative_volume < u.min_premarket_rel_volume {
            return Ok(None);
        }

        // Alpaca does not expose float; the float factor stays neutral
        let score = rank_score(gap_pct, relative_volume, None);

        Ok(Some(WatchlistEntry {
            symbol: symbol.clone(),
            rank: 0,
            prior_close,
            premarket_price: pm.price,
            premarket_high: pm.high.max(pm.price),
            premarket_volume: pm.volume,
            gap_pct,
            relative_volume,
            score,
        }))
    }

    async fn prior_close(&self, symbol: &Symbol) -> Result<Option<f64>> {
        let bars = self.broker.get_bars(symbol, Timeframe::OneDay, 2).await?;
        Ok(bars.last().map(|b| b.close).filter(|c| *c > 0.0))
    }

    async fn average_daily_volume(&self, symbol: &Symbol) -> Result<f64> {
        let bars = self.broker.get_bars(symbol, Timeframe::OneDay, 20).await?;
        if bars.is_empty() {
            return Ok(0.0);
        }
        Ok(bars.iter().map(|b| b.volume).sum::<f64>() / bars.len() as f64)
    }

    /// Current pre-market mid price plus session volume and high
    async fn premarket_data(&self, symbol: &Symbol) -> Result<Option<PremarketData>> {
        let quote = self.broker.get_latest_quote(symbol).await?;

        let price = if quote.is_usable() {
            quote.mid()
        } else if quote.ask > 0.0 {
            quote.ask
        } else if quote.bid > 0.0 {
            quote.bid
        } else {
            return Ok(None);
        };

        let bars = self.broker.get_bars(symbol, Timeframe::OneMin, 500).await?;
        let todays: Vec<&Bar> = {
            let today = et_now().date_naive();
            bars.iter()
                .filter(|b| b.datetime.with_timezone(&chrono_tz::America::New_York).date_naive() == today)
                .collect()
        };

        if todays.is_empty() {
            return Ok(Some(PremarketData {
                price,
                volume: 0,
                high: price,
            }));
        }

        let volume = todays.iter().map(|b| b.volume).sum::<f64>() as u64;
        let high = todays.iter().map(|b| b.high).fold(price, f64::max);

        Ok(Some(PremarketData {
            price,
            volume,
            high,
        }))
    }

    /// One-shot service entry used by the orchestrator and the CLI
    pub async fn run_service(&self, force: bool) -> Result<()> {
        let now_et = et_now();
        let u = &self.config.universe;
        if !force
            && !super::within_et_window(now_et, u.scan_window_start_minutes, u.scan_window_end_minutes)
        {
            warn!(
                "Outside the pre-market scan window ({:02}:{:02}-{:02}:{:02} ET); current ET time {}",
                u.scan_window_start_minutes / 60,
                u.scan_window_start_minutes % 60,
                u.scan_window_end_minutes / 60,
                u.scan_window_end_minutes % 60,
                now_et.format("%H:%M")
            );
        }

        self.run(force).await?;
        self.state.touch_heartbeat("premarket");
        Ok(())
    }
}

/// Ranking score: gap x relative volume, optionally boosted for low float
pub fn rank_score(gap_pct: f64, relative_volume: f64, float_shares: Option<f64>) -> f64 {
    let mut score = gap_pct * relative_volume * 100.0;

    if let Some(float) = float_shares {
        if float > 0.0 {
            let float_factor = (1.0 / (float / 10_000_000.0).sqrt()).min(2.0);
            score *= float_factor;
        }
    }

    score
}
