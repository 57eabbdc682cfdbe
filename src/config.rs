//! Configuration management
//!
//! Layered configuration: built-in defaults, an optional JSON config file,
//! and environment-variable overrides on top. API credentials only ever
//! come from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub universe: UniverseConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub buyer: BuyerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub seller: SellerConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            broker: BrokerConfig::default(),
            universe: UniverseConfig::default(),
            scanner: ScannerConfig::default(),
            buyer: BuyerConfig::default(),
            monitor: MonitorConfig::default(),
            seller: SellerConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults <- JSON file (if present) <- environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse config JSON {}", p.display()))?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("ALPACA_API_KEY") {
            self.broker.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("ALPACA_SECRET_KEY") {
            self.broker.api_secret = Some(secret);
        }
        if let Ok(url) = std::env::var("ALPACA_BASE_URL") {
            self.broker.base_url = url;
        }

        env_override("API_RATE_LIMIT", &mut self.broker.rate_limit_per_min);

        env_override("DAILY_WATCHLIST_SIZE", &mut self.universe.daily_watchlist_size);
        env_override("BASE_UNIVERSE_SIZE", &mut self.universe.base_universe_size);
        env_override("MIN_GAP_PCT", &mut self.universe.min_gap_pct);
        env_override("MIN_PREMARKET_VOLUME", &mut self.universe.min_premarket_volume);
        env_override("MIN_PREMARKET_REL_VOLUME", &mut self.universe.min_premarket_rel_volume);
        env_override("PRICE_MIN", &mut self.universe.price_min);
        env_override("PRICE_MAX", &mut self.universe.price_max);

        env_override("SCAN_INTERVAL_SECONDS", &mut self.scanner.interval_seconds);
        env_override("MIN_ENTRY_SCORE", &mut self.scanner.min_entry_score);
        env_override("MIN_BREAKOUT_PCT", &mut self.scanner.min_breakout_pct);
        env_override("MIN_RELATIVE_VOLUME", &mut self.scanner.min_relative_volume);
        env_override("RSI_MIN", &mut self.scanner.rsi_min);
        env_override("RSI_MAX", &mut self.scanner.rsi_max);
        env_override("REQUIRE_ABOVE_VWAP", &mut self.scanner.require_above_vwap);

        env_override("BUYER_INTERVAL_SECONDS", &mut self.buyer.interval_seconds);
        env_override("HOT_CHECK_INTERVAL", &mut self.buyer.hot_check_interval_seconds);
        env_override("SIGNAL_MAX_AGE_SECONDS", &mut self.buyer.signal_max_age_seconds);
        env_override("MAX_SLIPPAGE_PCT", &mut self.buyer.max_slippage_pct);
        env_override("MAX_SPREAD_PCT", &mut self.buyer.max_spread_pct);
        env_override("USE_LIMIT_ORDERS", &mut self.buyer.use_limit_orders);
        env_override("LIMIT_ORDER_BUFFER", &mut self.buyer.limit_order_buffer);
        env_override("MAX_POSITIONS", &mut self.buyer.max_positions);

        env_override("MONITOR_INTERVAL_SECONDS", &mut self.monitor.interval_seconds);
        env_override("SELLER_INTERVAL_SECONDS", &mut self.seller.interval_seconds);
        env_override("COOLDOWN_MINUTES", &mut self.seller.cooldown_minutes);

        env_override("STOP_LOSS_PCT", &mut self.risk.stop_loss_pct);
        env_override("BREAKEVEN_PROFIT", &mut self.risk.breakeven_profit);
        env_override("DECEL_EXIT_THRESHOLD", &mut self.risk.decel_exit_threshold);
        env_override("MIN_PROFIT_FOR_DECEL_CHECK", &mut self.risk.min_profit_for_decel_check);
    }
}

fn env_override<T: FromStr>(key: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!("Ignoring unparseable env override {}={}", key, raw),
        }
    }
}

/// Brokerage API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    /// Global broker budget; per-service slices must sum below this
    pub rate_limit_per_min: u32,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://paper-api.alpaca.markets".to_string(),
            rate_limit_per_min: 200,
            request_timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

/// Pre-market universe selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub daily_watchlist_size: usize,
    pub base_universe_size: usize,
    pub universe_path: String,
    pub min_gap_pct: f64,
    pub min_premarket_volume: u64,
    pub min_premarket_rel_volume: f64,
    pub price_min: f64,
    pub price_max: f64,
    /// Pre-market scan window, minutes after midnight ET
    pub scan_window_start_minutes: u32,
    pub scan_window_end_minutes: u32,
    pub api_budget_per_min: u32,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        UniverseConfig {
            daily_watchlist_size: 25,
            base_universe_size: 500,
            universe_path: "universes/base_universe/base_universe.txt".to_string(),
            min_gap_pct: 0.03,
            min_premarket_volume: 50_000,
            min_premarket_rel_volume: 2.0,
            price_min: 2.0,
            price_max: 50.0,
            scan_window_start_minutes: 8 * 60,       // 08:00 ET
            scan_window_end_minutes: 9 * 60 + 25,    // 09:25 ET
            api_budget_per_min: 120,
        }
    }
}

/// Signal scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub interval_seconds: u64,
    pub min_entry_score: u32,
    pub min_breakout_pct: f64,
    pub min_relative_volume: f64,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub require_above_vwap: bool,
    pub bars_primary: usize,
    pub bars_fast: usize,
    pub api_budget_per_min: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            interval_seconds: 45,
            min_entry_score: 60,
            min_breakout_pct: 0.01,
            min_relative_volume: 2.0,
            rsi_min: 40.0,
            rsi_max: 75.0,
            require_above_vwap: true,
            bars_primary: 50,
            bars_fast: 30,
            api_budget_per_min: 67,
        }
    }
}

/// Buyer configuration: entry validation and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerConfig {
    pub interval_seconds: u64,
    pub hot_check_interval_seconds: u64,
    pub hot_signal_min_score: u32,
    pub signal_max_age_seconds: i64,
    pub max_slippage_pct: f64,
    /// Reject when the mid has collapsed this far below the signal price
    pub max_reversal_pct: f64,
    pub max_spread_pct: f64,
    pub use_limit_orders: bool,
    pub limit_order_buffer: f64,
    pub max_positions: usize,
    pub size_standard_pct: f64,
    pub size_strong_pct: f64,
    pub size_maximum_pct: f64,
    pub api_budget_per_min: u32,
}

impl Default for BuyerConfig {
    fn default() -> Self {
        BuyerConfig {
            interval_seconds: 15,
            hot_check_interval_seconds: 5,
            hot_signal_min_score: 90,
            signal_max_age_seconds: 60,
            max_slippage_pct: 0.02,
            max_reversal_pct: 0.03,
            max_spread_pct: 0.02,
            use_limit_orders: true,
            limit_order_buffer: 0.005,
            max_positions: 20,
            size_standard_pct: 0.05,
            size_strong_pct: 0.07,
            size_maximum_pct: 0.10,
            api_budget_per_min: 10,
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub api_budget_per_min: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_seconds: 30,
            api_budget_per_min: 80,
        }
    }
}

/// Seller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerConfig {
    pub interval_seconds: u64,
    pub cooldown_minutes: i64,
    /// Drop sell signals older than this on load
    pub signal_max_age_minutes: i64,
    pub api_budget_per_min: u32,
}

impl Default for SellerConfig {
    fn default() -> Self {
        SellerConfig {
            interval_seconds: 15,
            cooldown_minutes: 15,
            signal_max_age_minutes: 2,
            api_budget_per_min: 5,
        }
    }
}

/// One trailing-stop tier: at `profit` (peak vs entry), trail `trail` below peak
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailingTier {
    pub profit: f64,
    pub trail: f64,
}

/// Risk rules applied by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub breakeven_profit: f64,
    /// Sorted ascending by profit threshold; the highest reached tier applies
    pub trailing_stops: Vec<TrailingTier>,
    pub decel_exit_threshold: f64,
    pub min_profit_for_decel_check: f64,
    /// Liquidate positions this many minutes before the session close
    pub eod_exit_minutes: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            stop_loss_pct: 0.025,
            breakeven_profit: 0.05,
            trailing_stops: vec![
                TrailingTier { profit: 0.05, trail: 0.02 },
                TrailingTier { profit: 0.10, trail: 0.03 },
                TrailingTier { profit: 0.15, trail: 0.04 },
                TrailingTier { profit: 0.20, trail: 0.05 },
                TrailingTier { profit: 0.30, trail: 0.07 },
                TrailingTier { profit: 0.50, trail: 0.10 },
                TrailingTier { profit: 1.00, trail: 0.15 },
            ],
            decel_exit_threshold: 0.5,
            min_profit_for_decel_check: 0.05,
            eod_exit_minutes: 5,
        }
    }
}

impl RiskConfig {
    /// Trailing percentage for the highest tier the peak profit has reached
    pub fn trailing_pct_for(&self, profit_pct: f64) -> Option<f64> {
        self.trailing_stops
            .iter()
            .filter(|t| profit_pct >= t.profit)
            .map(|t| t.trail)
            .last()
    }
}
