//! Typed accessors over the shared state directory
//!
//! One store per state file, each enforcing its file's ownership
//! discipline: the scanner overwrites signals, the monitor appends sell
//! signals, the seller clears them, trades are append-only, and the
//! positions map is reconciled against the broker's view.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::file::JsonStateFile;
use crate::broker::BrokerPosition;
use crate::error::StateError;
use crate::types::{DailyWatchlist, EntrySignal, Position, SellSignal, SignalFile, TradeRecord};

/// The shared state directory and its well-known files
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StateError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self, name: &str) -> JsonStateFile {
        JsonStateFile::new(self.root.join(name))
    }

    pub fn watchlist(&self) -> WatchlistStore {
        WatchlistStore {
            file: self.file("daily_watchlist.json"),
        }
    }

    pub fn signals(&self) -> SignalStore {
        SignalStore {
            file: self.file("signals.json"),
        }
    }

    pub fn positions(&self) -> PositionStore {
        PositionStore {
            file: self.file("positions.json"),
        }
    }

    pub fn sell_signals(&self) -> SellSignalStore {
        SellSignalStore {
            file: self.file("sell_signals.json"),
        }
    }

    pub fn trades(&self) -> TradeLog {
        TradeLog {
            file: self.file("trades.json"),
        }
    }

    pub fn cooldowns(&self) -> CooldownStore {
        CooldownStore {
            file: self.file("cooldowns.json"),
        }
    }

    /// Raw file handle for the orchestrator status document
    pub fn orchestrator_status_file(&self) -> JsonStateFile {
        self.file("orchestrator_status.json")
    }

    pub fn pid_path(&self, service: &str) -> PathBuf {
        self.root.join(format!("{service}.pid"))
    }

    pub fn heartbeat_path(&self, service: &str) -> PathBuf {
        self.root.join(format!("{service}.heartbeat"))
    }

    /// Record that a service completed a cycle just now
    pub fn touch_heartbeat(&self, service: &str) {
        let path = self.heartbeat_path(service);
        if let Err(e) = fs::write(&path, Utc::now().to_rfc3339()) {
            warn!("Failed to write heartbeat {}: {e}", path.display());
        }
    }

    /// Seconds since the service last heartbeat, if one exists
    pub fn heartbeat_age_seconds(&self, service: &str, now: DateTime<Utc>) -> Option<i64> {
        let raw = fs::read_to_string(self.heartbeat_path(service)).ok()?;
        let stamp = DateTime::parse_from_rfc3339(raw.trim()).ok()?;
        Some((now - stamp.with_timezone(&Utc)).num_seconds())
    }
}

// ==================== daily watchlist ====================

pub struct WatchlistStore {
    file: JsonStateFile,
}

impl WatchlistStore {
    /// Today's watchlist, or `None` when absent or from another date
    pub fn load_for(&self, date: NaiveDate) -> Result<Option<DailyWatchlist>, StateError> {
        let doc: Option<DailyWatchlist> = self.file.read()?;
        match doc {
            Some(w) if w.is_for(date) => Ok(Some(w)),
            Some(w) => {
                debug!("Watchlist on disk is for {}, not {date}", w.date);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, watchlist: &DailyWatchlist) -> Result<(), StateError> {
        self.file.write(&Some(watchlist.clone()))
    }
}

// ==================== entry signals ====================

pub struct SignalStore {
    file: JsonStateFile,
}

impl SignalStore {
    /// Overwrite with this cycle's signals
    pub fn save(&self, signals: Vec<EntrySignal>) -> Result<(), StateError> {
        self.file.write(&SignalFile {
            generated_at: Some(Utc::now()),
            signals,
        })
    }

    pub fn load(&self) -> Result<Vec<EntrySignal>, StateError> {
        let doc: SignalFile = self.file.read()?;
        Ok(doc.signals)
    }

    /// Signals younger than `max_age_seconds`, stalest dropped
    pub fn load_fresh(
        &self,
        now: DateTime<Utc>,
        max_age_seconds: i64,
    ) -> Result<Vec<EntrySignal>, StateError> {
        let mut signals = self.load()?;
        signals.retain(|s| s.is_fresh(now, max_age_seconds));
        Ok(signals)
    }
}

// ==================== positions ====================

pub struct PositionStore {
    file: JsonStateFile,
}

impl PositionStore {
    pub fn load(&self) -> Result<BTreeMap<String, Position>, StateError> {
        self.file.read()
    }

    pub fn insert(&self, position: Position) -> Result<(), StateError> {
        self.file.update(|map: &mut BTreeMap<String, Position>| {
            map.insert(position.symbol.as_str().to_string(), position);
        })?;
        Ok(())
    }

    pub fn remove(&self, symbol: &str) -> Result<Option<Position>, StateError> {
        let mut removed = None;
        self.file.update(|map: &mut BTreeMap<String, Position>| {
            removed = map.remove(symbol);
        })?;
        Ok(removed)
    }

    /// Ratchet the stop and peak for one position. The stop is only ever
    /// raised; a lower candidate leaves the stored value untouched.
    pub fn ratchet(
        &self,
        symbol: &str,
        new_peak: f64,
        new_stop: f64,
    ) -> Result<(), StateError> {
        self.file.update(|map: &mut BTreeMap<String, Position>| {
            if let Some(pos) = map.get_mut(symbol) {
                if new_peak > pos.peak_price {
                    pos.peak_price = new_peak;
                }
                if new_stop > pos.current_stop {
                    pos.current_stop = new_stop;
                }
            }
        })?;
        Ok(())
    }

    /// Replace the whole map with the broker-reconciled view
    pub fn replace(&self, positions: BTreeMap<String, Position>) -> Result<(), StateError> {
        self.file.write(&positions)
    }
}

/// Reconcile the local position map against the broker's report.
///
/// The broker is authoritative: local entries the broker no longer holds
/// are dropped, and broker positions with no local record are
/// reconstructed with a fresh hard stop (crash recovery). Pure function,
/// idempotent by construction.
pub fn reconcile_positions(
    local: BTreeMap<String, Position>,
    broker: &[BrokerPosition],
    stop_loss_pct: f64,
    now: DateTime<Utc>,
) -> BTreeMap<String, Position> {
    let mut reconciled = BTreeMap::new();

    for bp in broker {
        if bp.qty == 0 {
            continue;
        }
        let key = bp.symbol.as_str().to_string();
        match local.get(&key) {
            Some(existing) => {
                let mut pos = existing.clone();
                if pos.quantity != bp.qty {
                    warn!(
                        "{}: quantity drift (local {}, broker {}); trusting broker",
                        key, pos.quantity, bp.qty
                    );
                    pos.quantity = bp.qty;
                }
                reconciled.insert(key, pos);
            }
            None => {
                info!(
                    "{}: broker holds {} shares with no local record; reconstructing",
                    key, bp.qty
                );
                reconciled.insert(
                    key,
                    Position {
                        symbol: bp.symbol.clone(),
                        entry_price: bp.avg_entry_price,
                        quantity: bp.qty,
                        entry_time: now,
                        current_stop: bp.avg_entry_price * (1.0 - stop_loss_pct),
                        peak_price: bp.avg_entry_price,
                        signal_score: 0,
                        signal_price: bp.avg_entry_price,
                        vwap_at_entry: 0.0,
                        rsi_at_entry: 0.0,
                        breakout_pct: 0.0,
                        slippage_pct: 0.0,
                    },
                );
            }
        }
    }

    for key in local.keys() {
        if !reconciled.contains_key(key) {
            info!("{key}: no longer held at broker; dropping local record");
        }
    }

    reconciled
}

// ==================== sell signals ====================

pub struct SellSignalStore {
    file: JsonStateFile,
}

impl SellSignalStore {
    pub fn load(&self) -> Result<Vec<SellSignal>, StateError> {
        self.file.read()
    }

    /// Append new exit requests; existing entries are never mutated
    pub fn append(&self, new_signals: Vec<SellSignal>) -> Result<(), StateError> {
        if new_signals.is_empty() {
            return Ok(());
        }
        self.file.update(|list: &mut Vec<SellSignal>| {
            list.extend(new_signals);
        })?;
        Ok(())
    }

    /// Rewrite with only the entries still pending
    pub fn replace(&self, remaining: Vec<SellSignal>) -> Result<(), StateError> {
        self.file.write(&remaining)
    }
}

// ==================== trades ====================

pub struct TradeLog {
    file: JsonStateFile,
}

impl TradeLog {
    /// Append one completed trade; records are never rewritten
    pub fn append(&self, trade: TradeRecord) -> Result<(), StateError> {
        self.file.update(|list: &mut Vec<TradeRecord>| {
            list.push(trade);
        })?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<TradeRecord>, StateError> {
        self.file.read()
    }
}

// ==================== cooldowns ====================

pub struct CooldownStore {
    file: JsonStateFile,
}

impl CooldownStore {
    /// Start a cooldown for `symbol` until the given time.
    /// Expired entries are pruned lazily on write.
    pub fn set(&self, symbol: &str, until: DateTime<Utc>) -> Result<(), StateError> {
        let now = Utc::now();
        self.file
            .update(|map: &mut BTreeMap<String, DateTime<Utc>>| {
                map.retain(|_, t| *t > now);
                map.insert(symbol.to_string(), until);
            })?;
        Ok(())
    }

    pub fn until(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        let map: BTreeMap<String, DateTime<Utc>> = self.file.read()?;
        Ok(map.get(symbol).copied())
    }

    /// Whether the symbol may not be bought right now
    pub fn is_active(&self, symbol: &str, now: DateTime<Utc>) -> Result<bool, StateError> {
        Ok(self.until(symbol)?.map(|t| t > now).unwrap_or(false))
    }

    pub fn load_active(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, DateTime<Utc>>, StateError> {
        let mut map: BTreeMap<String, DateTime<Utc>> = self.file.read()?;
        map.retain(|_, t| *t > now);
        Ok(map)
    }
}
