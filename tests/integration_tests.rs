//! Integration tests for the momentum trading services
//!
//! These drive the buyer, monitor, seller, and pre-market scanner against
//! a scripted mock broker and a temporary state directory, covering the
//! end-to-end scenarios: entry fills, stop ratcheting, exits, cooldowns,
//! idempotent sells, and crash recovery.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use momentum_trader::broker::{
    Account, BrokerClient, BrokerPosition, Clock, OrderReport, OrderRequest, OrderSide,
    OrderStatus,
};
use momentum_trader::config::Config;
use momentum_trader::error::BrokerError;
use momentum_trader::services::{Buyer, Monitor, PreMarketScanner, Scanner, Seller};
use momentum_trader::state::StateDir;
use momentum_trader::types::{
    Bar, BreakoutRef, DailyWatchlist, EntrySignal, ExitReason, Position, Quote, SellSignal,
    Symbol, Timeframe, WatchlistEntry,
};

// =============================================================================
// Mock broker
// =============================================================================

/// How the mock settles submitted orders
#[derive(Debug, Clone, Copy)]
enum FillMode {
    /// Fill the full quantity immediately at the given price
    Immediate(f64),
    /// Leave the order open forever (drives the timeout path)
    Never,
    /// Fill part of the quantity immediately, then stall
    Partial(i64, f64),
}

struct MockState {
    clock: Clock,
    account: Account,
    positions: Vec<BrokerPosition>,
    quotes: HashMap<String, Quote>,
    bars: HashMap<(String, Timeframe), Vec<Bar>>,
    orders: HashMap<String, OrderReport>,
    submitted: Vec<OrderRequest>,
    fill_mode: FillMode,
    next_order_id: u64,
}

struct MockBroker {
    state: Mutex<MockState>,
    calls: AtomicU64,
}

impl MockBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                clock: Clock {
                    is_open: true,
                    next_open: Utc::now() + Duration::hours(18),
                    next_close: Utc::now() + Duration::hours(5),
                },
                account: Account {
                    equity: 100_000.0,
                    cash: 100_000.0,
                },
                positions: Vec::new(),
                quotes: HashMap::new(),
                bars: HashMap::new(),
                orders: HashMap::new(),
                submitted: Vec::new(),
                fill_mode: FillMode::Immediate(0.0),
                next_order_id: 1,
            }),
            calls: AtomicU64::new(0),
        })
    }

    fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        let mut s = self.state.lock().unwrap();
        s.quotes.insert(symbol.to_string(), Quote { bid, ask });
    }

    fn set_bars(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        let mut s = self.state.lock().unwrap();
        s.bars.insert((symbol.to_string(), timeframe), bars);
    }

    fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().unwrap().fill_mode = mode;
    }

    fn add_position(&self, symbol: &str, qty: i64, avg_entry_price: f64) {
        let mut s = self.state.lock().unwrap();
        s.positions.push(BrokerPosition {
            symbol: Symbol::new(symbol),
            qty,
            avg_entry_price,
        });
    }

    fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_clock(&self) -> Result<Clock, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().unwrap().clock.clone())
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().unwrap().account.clone())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn get_latest_quote(&self, symbol: &Symbol) -> Result<Quote, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let s = self.state.lock().unwrap();
        s.quotes
            .get(symbol.as_str())
            .copied()
            .ok_or_else(|| BrokerError::Permanent(format!("no quote for {symbol}")))
    }

    async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        _limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let s = self.state.lock().unwrap();
        Ok(s.bars
            .get(&(symbol.as_str().to_string(), timeframe))
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReport, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock().unwrap();
        let id = format!("order-{}", s.next_order_id);
        s.next_order_id += 1;
        s.submitted.push(request.clone());

        let report = match s.fill_mode {
            FillMode::Immediate(price) => {
                let fill_price = if price > 0.0 {
                    price
                } else {
                    request.limit_price.unwrap_or(0.0)
                };

                // Keep the broker's position book in sync with fills
                match request.side {
                    OrderSide::Buy => s.positions.push(BrokerPosition {
                        symbol: request.symbol.clone(),
                        qty: request.qty,
                        avg_entry_price: fill_price,
                    }),
                    OrderSide::Sell => {
                        s.positions.retain(|p| p.symbol != request.symbol);
                    }
                }

                OrderReport {
                    id: id.clone(),
                    status: OrderStatus::Filled,
                    filled_qty: request.qty,
                    filled_avg_price: Some(fill_price),
                }
            }
            FillMode::Never => OrderReport {
                id: id.clone(),
                status: OrderStatus::New,
                filled_qty: 0,
                filled_avg_price: None,
            },
            FillMode::Partial(qty, price) => OrderReport {
                id: id.clone(),
                status: OrderStatus::PartiallyFilled,
                filled_qty: qty,
                filled_avg_price: Some(price),
            },
        };

        s.orders.insert(id, report.clone());
        Ok(report)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderReport, BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let s = self.state.lock().unwrap();
        s.orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Permanent(format!("unknown order {order_id}")))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock().unwrap();
        if let Some(order) = s.orders.get_mut(order_id) {
            if order.status != OrderStatus::Filled {
                order.status = OrderStatus::Canceled;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Test utilities
// =============================================================================

fn test_setup() -> (Config, StateDir, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path().join("state")).unwrap();
    (Config::default(), state, dir)
}

fn bar_at(datetime: DateTime<Utc>, close: f64, volume: f64) -> Bar {
    Bar {
        datetime,
        open: close,
        high: close * 1.002,
        low: close * 0.998,
        close,
        volume,
    }
}

fn entry_signal(symbol: &str, price: f64, score: u32) -> EntrySignal {
    EntrySignal {
        symbol: Symbol::new(symbol),
        timestamp: Utc::now(),
        price,
        score,
        vwap: price * 0.98,
        rsi: 58.0,
        breakout_pct: 0.027,
        breakout_ref: BreakoutRef::PremarketHigh,
        relative_volume: 3.1,
        premarket_high: Some(price * 0.97),
        gap_pct: Some(0.04),
        velocity: 0.002,
        acceleration: Some(1.1),
    }
}

fn open_position(symbol: &str, entry: f64, qty: i64, stop: f64) -> Position {
    Position {
        symbol: Symbol::new(symbol),
        entry_price: entry,
        quantity: qty,
        entry_time: Utc::now() - Duration::minutes(30),
        current_stop: stop,
        peak_price: entry,
        signal_score: 65,
        signal_price: entry,
        vwap_at_entry: entry * 0.98,
        rsi_at_entry: 58.0,
        breakout_pct: 0.027,
        slippage_pct: 0.0,
    }
}

fn sell_signal(symbol: &str, reason: ExitReason, entry: f64, qty: i64, trigger: f64) -> SellSignal {
    SellSignal {
        symbol: Symbol::new(symbol),
        timestamp: Utc::now(),
        reason,
        trigger_price: trigger,
        quantity: qty,
        entry_price: entry,
        entry_time: Utc::now() - Duration::hours(1),
    }
}

fn market_clock(minutes_to_close: i64) -> Clock {
    Clock {
        is_open: true,
        next_open: Utc::now() + Duration::hours(18),
        next_close: Utc::now() + Duration::minutes(minutes_to_close),
    }
}

// =============================================================================
// Buyer
// =============================================================================

#[tokio::test]
async fn test_happy_path_entry_creates_position() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Mid validates at 5.71, fill at 5.71, 5% tier of 100k equity
    broker.set_quote("ABCD", 5.70, 5.72);
    broker.set_fill_mode(FillMode::Immediate(5.71));
    state
        .signals()
        .save(vec![entry_signal("ABCD", 5.70, 65)])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    let positions = state.positions().load().unwrap();
    let pos = positions.get("ABCD").expect("position created");
    assert_eq!(pos.quantity, 875); // floor(100000 * 0.05 / 5.71)
    assert!((pos.entry_price - 5.71).abs() < 1e-9);
    assert!((pos.current_stop - 5.71 * 0.975).abs() < 1e-9);
    assert!((pos.peak_price - 5.71).abs() < 1e-9);
    assert_eq!(pos.signal_score, 65);

    // Limit order at round(5.71 * 1.005, 2) = 5.74
    let orders = broker.submitted_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert!((orders[0].limit_price.unwrap() - 5.74).abs() < 1e-9);
}

#[tokio::test]
async fn test_buyer_rejects_slippage() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Signal at 10.00 but the quote mid has run to 10.25
    broker.set_quote("ABCD", 10.24, 10.26);
    state
        .signals()
        .save(vec![entry_signal("ABCD", 10.00, 65)])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    assert!(broker.submitted_orders().is_empty());
    assert!(state.positions().load().unwrap().is_empty());
}

#[tokio::test]
async fn test_buyer_honors_cooldown() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.set_quote("ABCD", 5.69, 5.71);
    broker.set_fill_mode(FillMode::Immediate(5.71));
    state
        .cooldowns()
        .set("ABCD", Utc::now() + Duration::minutes(10))
        .unwrap();
    state
        .signals()
        .save(vec![entry_signal("ABCD", 5.70, 65)])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    assert!(broker.submitted_orders().is_empty());
}

#[tokio::test]
async fn test_buyer_skips_held_symbol_and_respects_max_positions() {
    let (mut config, state, _guard) = test_setup();
    config.buyer.max_positions = 2;
    let broker = MockBroker::new();

    broker.set_fill_mode(FillMode::Immediate(10.0));
    for sym in ["AAAA", "BBBB", "CCCC"] {
        broker.set_quote(sym, 9.99, 10.01);
    }

    // Already holding AAAA locally
    state
        .positions()
        .insert(open_position("AAAA", 10.0, 100, 9.75))
        .unwrap();

    state
        .signals()
        .save(vec![
            entry_signal("AAAA", 10.0, 80),
            entry_signal("BBBB", 10.0, 75),
            entry_signal("CCCC", 10.0, 70),
        ])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    // AAAA skipped (held); BBBB bought (slot 2 of 2); CCCC blocked by cap
    let orders = broker.submitted_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].symbol.as_str(), "BBBB");
    assert_eq!(state.positions().load().unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_signal_ignored() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.set_quote("ABCD", 5.69, 5.71);
    broker.set_fill_mode(FillMode::Immediate(5.71));

    let signal = entry_signal("ABCD", 5.70, 65);
    state.signals().save(vec![signal.clone()]).unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();
    assert_eq!(broker.submitted_orders().len(), 1);

    // Same (symbol, timestamp) re-seen after the position is gone
    state.positions().replace(Default::default()).unwrap();
    state.signals().save(vec![signal]).unwrap();
    buyer.process_signals(None).await.unwrap();
    assert_eq!(broker.submitted_orders().len(), 1);
}

#[tokio::test]
async fn test_hot_path_only_touches_high_scores() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.set_fill_mode(FillMode::Immediate(10.0));
    broker.set_quote("HOTT", 9.99, 10.01);
    broker.set_quote("WARM", 9.99, 10.01);

    state
        .signals()
        .save(vec![
            entry_signal("HOTT", 10.0, 92),
            entry_signal("WARM", 10.0, 75),
        ])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(Some(90)).await.unwrap();

    let orders = broker.submitted_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].symbol.as_str(), "HOTT");
}

#[tokio::test(start_paused = true)]
async fn test_order_timeout_with_partial_fill_keeps_position() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.set_quote("ABCD", 5.69, 5.71);
    broker.set_fill_mode(FillMode::Partial(100, 5.71));
    state
        .signals()
        .save(vec![entry_signal("ABCD", 5.70, 65)])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    // The partial fill at timeout becomes the position
    let positions = state.positions().load().unwrap();
    assert_eq!(positions["ABCD"].quantity, 100);
}

#[tokio::test(start_paused = true)]
async fn test_order_timeout_without_fill_creates_nothing() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.set_quote("ABCD", 5.69, 5.71);
    broker.set_fill_mode(FillMode::Never);
    state
        .signals()
        .save(vec![entry_signal("ABCD", 5.70, 65)])
        .unwrap();

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.process_signals(None).await.unwrap();

    assert!(state.positions().load().unwrap().is_empty());
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_crash_recovery_reconstructs_position_without_duplicate_buy() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Killed between fill and state write: broker holds 200 XYZ,
    // positions.json knows nothing
    broker.add_position("XYZ", 200, 4.00);
    broker.set_quote("XYZ", 4.01, 4.03);
    broker.set_fill_mode(FillMode::Immediate(4.02));

    let mut buyer = Buyer::new(config, state.clone(), broker.clone());
    buyer.reconcile_on_startup().await.unwrap();

    let positions = state.positions().load().unwrap();
    let xyz = positions.get("XYZ").expect("reconstructed");
    assert_eq!(xyz.quantity, 200);
    assert!((xyz.entry_price - 4.00).abs() < 1e-9);
    assert!((xyz.current_stop - 4.00 * 0.975).abs() < 1e-9);

    // A late signal for the same symbol must not double-buy
    state
        .signals()
        .save(vec![entry_signal("XYZ", 4.02, 70)])
        .unwrap();
    buyer.process_signals(None).await.unwrap();
    assert!(broker.submitted_orders().is_empty());
}

// =============================================================================
// Monitor
// =============================================================================

fn accel_bars(current: f64, price_2min_ago: f64, price_5min_ago: f64) -> (Vec<Bar>, Vec<Bar>) {
    let now = Utc::now();
    let b2 = vec![
        bar_at(now - Duration::minutes(2), price_2min_ago, 1000.0),
        bar_at(now, current, 1000.0),
    ];
    let b5 = vec![
        bar_at(now - Duration::minutes(5), price_5min_ago, 1000.0),
        bar_at(now, current, 1000.0),
    ];
    (b2, b5)
}

#[tokio::test]
async fn test_monitor_stop_loss_emits_sell_signal() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Entry 8.00, stop 7.80, price prints 7.79
    broker.add_position("ABCD", 100, 8.00);
    state
        .positions()
        .insert(open_position("ABCD", 8.00, 100, 7.80))
        .unwrap();

    let (b2, b5) = accel_bars(7.79, 7.82, 7.85);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);

    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(120)).await.unwrap();

    let signals = state.sell_signals().load().unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, ExitReason::StopLoss);
    assert_eq!(signals[0].quantity, 100);
    assert!((signals[0].trigger_price - 7.79).abs() < 1e-9);
}

#[tokio::test]
async fn test_monitor_breakeven_then_trailing_ratchet() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Entry 10.00 with stop 9.75; the peak walks up over three cycles
    broker.add_position("ABCD", 100, 10.00);
    state
        .positions()
        .insert(open_position("ABCD", 10.00, 100, 9.75))
        .unwrap();

    // Peak 10.50 (+5%): stop ratchets to the 2% trail, above entry
    let (b2, b5) = accel_bars(10.50, 10.48, 10.45);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);
    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(120)).await.unwrap();

    let pos = state.positions().load().unwrap()["ABCD"].clone();
    assert!((pos.current_stop - 10.29).abs() < 1e-9);
    assert!((pos.peak_price - 10.50).abs() < 1e-9);

    // Peak 10.80: trail raises the stop to 10.584
    let (b2, b5) = accel_bars(10.80, 10.78, 10.75);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);
    monitor.run_once(&market_clock(120)).await.unwrap();

    let pos = state.positions().load().unwrap()["ABCD"].clone();
    assert!((pos.current_stop - 10.584).abs() < 1e-9);

    // Price drifts back to 10.60 (above the stop) on a flat tape:
    // nothing moves down
    let (b2, b5) = accel_bars(10.60, 10.60, 10.60);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);
    monitor.run_once(&market_clock(120)).await.unwrap();

    let pos = state.positions().load().unwrap()["ABCD"].clone();
    assert!((pos.current_stop - 10.584).abs() < 1e-9);
    assert!((pos.peak_price - 10.80).abs() < 1e-9);
    assert!(state.sell_signals().load().unwrap().is_empty());

    // Price touches 10.58: trailing stop fires
    let (b2, b5) = accel_bars(10.58, 10.60, 10.62);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);
    monitor.run_once(&market_clock(120)).await.unwrap();

    let signals = state.sell_signals().load().unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, ExitReason::TrailingStop);
}

#[tokio::test]
async fn test_monitor_deceleration_exit() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // +8% profit, 2-min velocity 0.001 vs 5-min 0.004: acceleration 0.25
    broker.add_position("ABCD", 100, 10.00);
    let mut pos = open_position("ABCD", 10.00, 100, 10.00);
    pos.peak_price = 10.80;
    state.positions().insert(pos).unwrap();

    let current = 10.80;
    let p2 = current / (1.0 + 0.001 * 2.0);
    let p5 = current / (1.0 + 0.004 * 5.0);
    let (b2, b5) = accel_bars(current, p2, p5);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);

    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(120)).await.unwrap();

    let signals = state.sell_signals().load().unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, ExitReason::Deceleration);
}

#[tokio::test]
async fn test_monitor_eod_exit() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.add_position("ABCD", 100, 10.00);
    state
        .positions()
        .insert(open_position("ABCD", 10.00, 100, 9.75))
        .unwrap();

    let (b2, b5) = accel_bars(10.05, 10.04, 10.02);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);

    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(4)).await.unwrap();

    let signals = state.sell_signals().load().unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, ExitReason::Eod);
}

#[tokio::test]
async fn test_monitor_drops_positions_not_at_broker() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    // Local record exists but the broker is flat
    state
        .positions()
        .insert(open_position("GONE", 5.00, 50, 4.87))
        .unwrap();

    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(120)).await.unwrap();

    assert!(state.positions().load().unwrap().is_empty());
}

#[tokio::test]
async fn test_monitor_does_not_duplicate_pending_exits() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.add_position("ABCD", 100, 8.00);
    state
        .positions()
        .insert(open_position("ABCD", 8.00, 100, 7.80))
        .unwrap();

    let (b2, b5) = accel_bars(7.79, 7.82, 7.85);
    broker.set_bars("ABCD", Timeframe::TwoMin, b2);
    broker.set_bars("ABCD", Timeframe::FiveMin, b5);

    let monitor = Monitor::new(config, state.clone(), broker.clone());
    monitor.run_once(&market_clock(120)).await.unwrap();
    monitor.run_once(&market_clock(120)).await.unwrap();

    assert_eq!(state.sell_signals().load().unwrap().len(), 1);
}

// =============================================================================
// Seller
// =============================================================================

#[tokio::test]
async fn test_seller_executes_exit_with_full_bookkeeping() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.add_position("ABCD", 100, 8.00);
    broker.set_fill_mode(FillMode::Immediate(7.79));
    state
        .positions()
        .insert(open_position("ABCD", 8.00, 100, 7.80))
        .unwrap();
    state
        .sell_signals()
        .replace(vec![sell_signal("ABCD", ExitReason::StopLoss, 8.00, 100, 7.79)])
        .unwrap();

    let before = Utc::now();
    let mut seller = Seller::new(config.clone(), state.clone(), broker.clone());
    seller.run_once().await.unwrap();

    // Trade appended with computed P&L (about -2.6%)
    let trades = state.trades().load().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, ExitReason::StopLoss);
    assert!((trades[0].pnl_pct - (7.79 - 8.00) / 8.00).abs() < 1e-9);
    assert!((trades[0].pnl_dollars - (7.79 - 8.00) * 100.0).abs() < 1e-6);
    assert_eq!(trades[0].signal_score, 65);

    // Position removed, cooldown started, queue cleared
    assert!(state.positions().load().unwrap().is_empty());
    let until = state.cooldowns().until("ABCD").unwrap().unwrap();
    let expected = before + Duration::minutes(config.seller.cooldown_minutes);
    assert!((until - expected).num_seconds().abs() <= 5);
    assert!(state.sell_signals().load().unwrap().is_empty());

    // Market sell of the full quantity
    let orders = broker.submitted_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert_eq!(orders[0].qty, 100);
    assert!(orders[0].limit_price.is_none());
}

#[tokio::test]
async fn test_duplicate_sell_signal_produces_one_trade() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.add_position("ABCD", 100, 8.00);
    broker.set_fill_mode(FillMode::Immediate(7.79));
    state
        .positions()
        .insert(open_position("ABCD", 8.00, 100, 7.80))
        .unwrap();

    // The same exit queued twice
    let sig = sell_signal("ABCD", ExitReason::StopLoss, 8.00, 100, 7.79);
    state
        .sell_signals()
        .replace(vec![sig.clone(), sig])
        .unwrap();

    let mut seller = Seller::new(config, state.clone(), broker.clone());
    seller.run_once().await.unwrap();
    seller.run_once().await.unwrap();

    // The second copy found the broker flat and was dropped
    assert_eq!(state.trades().load().unwrap().len(), 1);
    assert_eq!(broker.submitted_orders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_seller_keeps_unfilled_signal_for_retry() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    broker.add_position("ABCD", 100, 8.00);
    broker.set_fill_mode(FillMode::Never);
    state
        .sell_signals()
        .replace(vec![sell_signal("ABCD", ExitReason::StopLoss, 8.00, 100, 7.79)])
        .unwrap();

    let mut seller = Seller::new(config, state.clone(), broker.clone());
    seller.run_once().await.unwrap();

    // Not filled: the signal stays queued for the next cycle
    assert_eq!(state.sell_signals().load().unwrap().len(), 1);
    assert!(state.trades().load().unwrap().is_empty());
}

// =============================================================================
// Scanner
// =============================================================================

fn scanner_bars(pm_high: f64) -> Vec<Bar> {
    // A session that gapped over the pre-market high and chops sideways
    // above it: alternating closes keep RSI mid-range, the final bar
    // prints a modest new high on heavy volume.
    let now = Utc::now();
    let mut bars = Vec::new();
    let mut close = pm_high + 0.05;
    for i in 0..29 {
        close += if i % 2 == 0 { 0.010 } else { -0.008 };
        bars.push(bar_at(now - Duration::minutes(5 * (30 - i)), close, 1000.0));
    }
    bars.push(bar_at(now, close + 0.022, 4500.0));
    bars
}

#[tokio::test]
async fn test_scanner_emits_signal_for_breakout() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    let watchlist = DailyWatchlist {
        date: chrono::Utc::now()
            .with_timezone(&chrono_tz::America::New_York)
            .date_naive(),
        generated_at: Utc::now(),
        entries: vec![WatchlistEntry {
            symbol: Symbol::new("ABCD"),
            rank: 1,
            prior_close: 5.20,
            premarket_price: 5.50,
            premarket_high: 5.55,
            premarket_volume: 250_000,
            gap_pct: 0.058,
            relative_volume: 3.0,
            score: 17.4,
        }],
    };
    state.watchlist().save(&watchlist).unwrap();

    broker.set_bars("ABCD", Timeframe::FiveMin, scanner_bars(5.55));
    broker.set_bars("ABCD", Timeframe::TwoMin, scanner_bars(5.55));

    let scanner = Scanner::new(config, state.clone(), broker.clone());
    scanner.run_once().await.unwrap();

    let signals = state.signals().load().unwrap();
    assert_eq!(signals.len(), 1);
    let s = &signals[0];
    assert_eq!(s.symbol.as_str(), "ABCD");
    assert_eq!(s.breakout_ref, BreakoutRef::PremarketHigh);
    assert!(s.score >= 60, "score was {}", s.score);
    assert!(s.breakout_pct > 0.01);
    assert!(s.price > s.vwap);
    // Gap bonus came from the watchlist entry
    assert_eq!(s.gap_pct, Some(0.058));
}

#[tokio::test]
async fn test_scanner_two_calls_per_symbol() {
    let (config, state, _guard) = test_setup();
    let broker = MockBroker::new();

    let today = chrono::Utc::now()
        .with_timezone(&chrono_tz::America::New_York)
        .date_naive();
    let entries = (0..25)
        .map(|i| WatchlistEntry {
            symbol: Symbol::new(format!("SYM{i}")),
            rank: i + 1,
            prior_close: 5.0,
            premarket_price: 5.3,
            premarket_high: 5.4,
            premarket_volume: 100_000,
            gap_pct: 0.06,
            relative_volume: 2.5,
            score: 15.0,
        })
        .collect();
    state
        .watchlist()
        .save(&DailyWatchlist {
            date: today,
            generated_at: Utc::now(),
            entries,
        })
        .unwrap();

    let scanner = Scanner::new(config, state.clone(), broker.clone());
    scanner.run_once().await.unwrap();

    // Exactly 2 broker calls per symbol, inside the 67/min budget
    assert_eq!(broker.call_count(), 50);
}

// =============================================================================
// Pre-market scanner
// =============================================================================

#[tokio::test]
async fn test_premarket_builds_ranked_watchlist() {
    let (mut config, state, guard) = test_setup();

    // Base universe file with three tickers
    let universe_path = guard.path().join("base_universe.txt");
    std::fs::write(&universe_path, "GAPR\nFLAT\nTHIN\n").unwrap();
    config.universe.universe_path = universe_path.to_string_lossy().into_owned();

    let broker = MockBroker::new();
    let now = Utc::now();
    let day_bar = |close: f64, volume: f64| bar_at(now - Duration::days(1), close, volume);

    // GAPR: 7% gap, heavy pre-market tape -> passes
    broker.set_quote("GAPR", 5.30, 5.40);
    broker.set_bars("GAPR", Timeframe::OneDay, vec![day_bar(5.0, 100_000.0)]);
    broker.set_bars(
        "GAPR",
        Timeframe::OneMin,
        vec![bar_at(now, 5.38, 150_000.0), bar_at(now, 5.42, 100_000.0)],
    );

    // FLAT: no gap -> filtered
    broker.set_quote("FLAT", 5.00, 5.02);
    broker.set_bars("FLAT", Timeframe::OneDay, vec![day_bar(5.0, 100_000.0)]);
    broker.set_bars("FLAT", Timeframe::OneMin, vec![bar_at(now, 5.01, 300_000.0)]);

    // THIN: gap but almost no pre-market volume -> filtered
    broker.set_quote("THIN", 5.30, 5.40);
    broker.set_bars("THIN", Timeframe::OneDay, vec![day_bar(5.0, 100_000.0)]);
    broker.set_bars("THIN", Timeframe::OneMin, vec![bar_at(now, 5.35, 10_000.0)]);

    let scanner = PreMarketScanner::new(config, state.clone(), broker.clone());
    let watchlist = scanner.run(true).await.unwrap();

    assert_eq!(watchlist.entries.len(), 1);
    let e = &watchlist.entries[0];
    assert_eq!(e.symbol.as_str(), "GAPR");
    assert_eq!(e.rank, 1);
    assert!((e.gap_pct - 0.07).abs() < 1e-9);
    assert!(e.premarket_high >= e.premarket_price);

    // Persisted and reloadable for today
    let today = chrono::Utc::now()
        .with_timezone(&chrono_tz::America::New_York)
        .date_naive();
    assert!(state.watchlist().load_for(today).unwrap().is_some());
}

#[tokio::test]
async fn test_premarket_refreshes_at_most_once_per_day() {
    let (mut config, state, guard) = test_setup();

    let universe_path = guard.path().join("base_universe.txt");
    std::fs::write(&universe_path, "GAPR\n").unwrap();
    config.universe.universe_path = universe_path.to_string_lossy().into_owned();

    let broker = MockBroker::new();
    let now = Utc::now();
    broker.set_quote("GAPR", 5.30, 5.40);
    broker.set_bars(
        "GAPR",
        Timeframe::OneDay,
        vec![bar_at(now - Duration::days(1), 5.0, 100_000.0)],
    );
    broker.set_bars("GAPR", Timeframe::OneMin, vec![bar_at(now, 5.38, 250_000.0)]);

    let scanner = PreMarketScanner::new(config, state.clone(), broker.clone());
    scanner.run(false).await.unwrap();
    let calls_after_first = broker.call_count();

    // A second run without force returns the existing list, no rescans
    scanner.run(false).await.unwrap();
    assert_eq!(broker.call_count(), calls_after_first);
}
