//! Broker-facing types: market clock, account, positions, and orders

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Symbol;

/// Market clock snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

impl Clock {
    /// Minutes until the session closes; negative when already past close
    pub fn minutes_to_close(&self, now: DateTime<Utc>) -> i64 {
        (self.next_close - now).num_minutes()
    }
}

/// Account snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub equity: f64,
    pub cash: f64,
}

/// A position as the broker reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub qty: i64,
    pub avg_entry_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
}

/// Order submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub qty: i64,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, qty: i64, side: OrderSide) -> Self {
        OrderRequest {
            symbol,
            qty,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
        }
    }

    pub fn limit(symbol: Symbol, qty: i64, side: OrderSide, limit_price: f64) -> Self {
        OrderRequest {
            symbol,
            qty,
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Day,
            limit_price: Some(limit_price),
        }
    }
}

/// Broker-reported order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Expired,
    Rejected,
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// Terminal without a full fill
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// Order state snapshot returned by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub id: String,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub filled_avg_price: Option<f64>,
}
