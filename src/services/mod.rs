//! The five cooperating services
//!
//! Each service is a long-running loop of `do_work(); sleep(remaining)`,
//! gated on the broker's market clock, with a heartbeat written after
//! every completed cycle. Services talk to each other only through the
//! shared state directory.

pub mod buyer;
pub mod monitor;
pub mod premarket;
pub mod scanner;
pub mod seller;

pub use buyer::Buyer;
pub use monitor::Monitor;
pub use premarket::PreMarketScanner;
pub use scanner::Scanner;
pub use seller::Seller;

use chrono::{DateTime, Timelike};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sleep while the market is closed between clock polls
pub const MARKET_CLOSED_SLEEP: Duration = Duration::from_secs(300);

/// Back-off after an unexpected cycle error
pub const ERROR_SLEEP: Duration = Duration::from_secs(60);

/// Service names used for PID files, heartbeats, and log files
pub const SERVICE_NAMES: [&str; 5] = ["seller", "buyer", "monitor", "scanner", "premarket"];

/// Current wall-clock time in Eastern market time
pub fn et_now() -> DateTime<Tz> {
    chrono::Utc::now().with_timezone(&New_York)
}

/// Whether an ET timestamp falls inside a minutes-after-midnight window
pub fn within_et_window(now_et: DateTime<Tz>, start_minutes: u32, end_minutes: u32) -> bool {
    let current = now_et.hour() * 60 + now_et.minute();
    current >= start_minutes && current <= end_minutes
}

/// Sleep in slices so a shutdown request is honored promptly
pub async fn sleep_interruptible(duration: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(500);
    let mut remaining = duration;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}
