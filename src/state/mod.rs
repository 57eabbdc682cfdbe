//! Durable shared state
//!
//! The services coordinate exclusively through JSON files in a shared
//! state directory: advisory-locked, atomically replaced, one writer per
//! file.

pub mod file;
pub mod stores;

pub use file::JsonStateFile;
pub use stores::{
    reconcile_positions, CooldownStore, PositionStore, SellSignalStore, SignalStore, StateDir,
    TradeLog, WatchlistStore,
};
