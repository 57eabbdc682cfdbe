//! Brokerage access layer
//!
//! The services depend only on the narrow [`BrokerClient`] trait; the
//! Alpaca REST implementation lives behind it, and the integration tests
//! substitute a scripted mock.

pub mod alpaca;
pub mod types;

pub use alpaca::{AlpacaClient, Credentials};
pub use types::{
    Account, BrokerPosition, Clock, OrderReport, OrderRequest, OrderSide, OrderStatus, OrderType,
    TimeInForce,
};

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{Bar, Quote, Symbol, Timeframe};

/// The trading operations the execution core needs from a brokerage
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_clock(&self) -> Result<Clock, BrokerError>;

    async fn get_account(&self) -> Result<Account, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_latest_quote(&self, symbol: &Symbol) -> Result<Quote, BrokerError>;

    async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReport, BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderReport, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
}
