//! Exchange capability interface.
//!
//! Everything the engine needs from a venue goes through [`ExchangeGateway`]. All
//! calls are fallible; the engine logs failures and treats them as "no progress".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::types::{
    Equity, Fill, FundingAccrual, InstrumentRules, InstrumentSnapshot, LimitOrder, OrderAck,
};

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Snapshots for every tradable instrument.
    async fn list_instrument_snapshots(&self) -> GatewayResult<Vec<InstrumentSnapshot>>;

    async fn get_snapshot(&self, symbol: &str) -> GatewayResult<Option<InstrumentSnapshot>>;

    async fn get_instrument_rules(&self, symbol: &str) -> GatewayResult<InstrumentRules>;

    /// Conforms price and quantity to the venue's steps before submitting.
    async fn place_limit_order(&self, order: &LimitOrder) -> GatewayResult<OrderAck>;

    /// Absolute size of the current position, zero when flat.
    async fn get_open_quantity(&self, symbol: &str) -> GatewayResult<Decimal>;

    async fn get_fills(&self, symbol: &str, order_ref: &str) -> GatewayResult<Vec<Fill>>;

    /// Funding settled for `symbol` in `coin` between `from` and `to`.
    async fn get_funding_accruals(
        &self,
        symbol: &str,
        coin: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<FundingAccrual>>;

    async fn get_account_equity(&self, coin: &str) -> GatewayResult<Equity>;
}
