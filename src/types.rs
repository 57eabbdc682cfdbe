//! Core data types shared across the trading services

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for bar data
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub datetime: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Bar {
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Typical price (H+L+C)/3, the VWAP input
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Bar timeframes supported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1Min")]
    OneMin,
    #[serde(rename = "2Min")]
    TwoMin,
    #[serde(rename = "5Min")]
    FiveMin,
    #[serde(rename = "1Day")]
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1Min",
            Timeframe::TwoMin => "2Min",
            Timeframe::FiveMin => "5Min",
            Timeframe::OneDay => "1Day",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stock ticker symbol (uppercase)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Latest bid/ask quote
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread as a fraction of the mid price
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask - self.bid) / mid
    }

    pub fn is_usable(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0
    }
}

/// One row of the daily watchlist produced by the pre-market scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: Symbol,
    pub rank: u32,
    pub prior_close: f64,
    pub premarket_price: f64,
    pub premarket_high: f64,
    pub premarket_volume: u64,
    pub gap_pct: f64,
    pub relative_volume: f64,
    pub score: f64,
}

/// The daily watchlist document, refreshed at most once per trading date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyWatchlist {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<WatchlistEntry>,
}

impl DailyWatchlist {
    pub fn is_for(&self, date: NaiveDate) -> bool {
        self.date == date
    }

    pub fn entry(&self, symbol: &Symbol) -> Option<&WatchlistEntry> {
        self.entries.iter().find(|e| &e.symbol == symbol)
    }
}

/// Reference level used for breakout measurement, in fixed priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakoutRef {
    PremarketHigh,
    SessionHigh,
    PriorClose,
}

impl std::fmt::Display for BreakoutRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakoutRef::PremarketHigh => "premarket_high",
            BreakoutRef::SessionHigh => "session_high",
            BreakoutRef::PriorClose => "prior_close",
        };
        f.write_str(s)
    }
}

/// Scored entry signal emitted by the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    /// Reference price at signal time (last 5-minute close)
    pub price: f64,
    pub score: u32,
    pub vwap: f64,
    pub rsi: f64,
    pub breakout_pct: f64,
    pub breakout_ref: BreakoutRef,
    pub relative_volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premarket_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_pct: Option<f64>,
    /// Per-period price change rate over the last 5 bars
    pub velocity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
}

impl EntrySignal {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_seconds: i64) -> bool {
        let age = self.age(now);
        age >= chrono::Duration::zero() && age.num_milliseconds() <= max_age_seconds * 1000
    }
}

/// Scanner output document (overwritten each cycle)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signals: Vec<EntrySignal>,
}

/// Position-sizing tier derived from the signal score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    Standard,
    Strong,
    Maximum,
}

impl ScoreTier {
    pub fn from_score(score: u32) -> Self {
        if score >= 95 {
            ScoreTier::Maximum
        } else if score >= 85 {
            ScoreTier::Strong
        } else {
            ScoreTier::Standard
        }
    }
}

impl std::fmt::Display for ScoreTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScoreTier::Standard => "STANDARD",
            ScoreTier::Strong => "STRONG",
            ScoreTier::Maximum => "MAXIMUM",
        };
        f.write_str(s)
    }
}

/// Open long position tracked in positions.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub entry_price: f64,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    /// Active stop price; never lowered once raised
    pub current_stop: f64,
    /// Highest price seen since entry, the trailing-stop anchor
    pub peak_price: f64,
    pub signal_score: u32,
    pub signal_price: f64,
    pub vwap_at_entry: f64,
    pub rsi_at_entry: f64,
    pub breakout_pct: f64,
    #[serde(default)]
    pub slippage_pct: f64,
}

impl Position {
    pub fn unrealized_pct(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) / self.entry_price
    }

    /// Peak profit relative to entry, which selects the trailing tier
    pub fn peak_profit_pct(&self) -> f64 {
        (self.peak_price - self.entry_price) / self.entry_price
    }
}

/// Why a position is being exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    Deceleration,
    Eod,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Deceleration => "deceleration",
            ExitReason::Eod => "eod",
        };
        f.write_str(s)
    }
}

/// Exit request emitted by the monitor, consumed by the seller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellSignal {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub reason: ExitReason,
    /// Price that tripped the exit rule
    pub trigger_price: f64,
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
}

/// Completed round trip, appended to trades.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: i64,
    pub pnl_pct: f64,
    pub pnl_dollars: f64,
    pub hold_time_hours: f64,
    pub reason: ExitReason,
    pub signal_score: u32,
}
