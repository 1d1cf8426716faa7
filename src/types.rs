use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest known state of one perpetual instrument.
///
/// Replaced wholesale on every poll; nothing is merged field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    /// Signed funding rate for the upcoming settlement (0.01 = 1%).
    pub funding_rate: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub bid_price: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    /// Next funding settlement ("event") time.
    pub next_event_time: Option<DateTime<Utc>>,
    /// Hours between settlements, when the venue reports it.
    pub event_interval_hours: Option<u32>,
}

impl InstrumentSnapshot {
    pub fn abs_funding_rate(&self) -> Option<Decimal> {
        self.funding_rate.map(|r| r.abs())
    }

    /// Entry reference price: first available of mark, last, bid, ask.
    pub fn reference_price(&self) -> Option<Decimal> {
        [self.mark_price, self.last_price, self.bid_price, self.ask_price]
            .into_iter()
            .flatten()
            .find(|p| *p > Decimal::ZERO)
    }

    /// Price to close against: the ask when buying back a short, the bid when
    /// selling out of a long, falling back to mark then last.
    pub fn closing_price(&self, close_side: Side) -> Option<Decimal> {
        let book_side = match close_side {
            Side::Buy => self.ask_price,
            Side::Sell => self.bid_price,
        };
        [book_side, self.mark_price, self.last_price]
            .into_iter()
            .flatten()
            .find(|p| *p > Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Positive funding is paid by longs, so we short it; negative, we go long.
    pub fn for_funding_rate(rate: Decimal) -> Side {
        if rate > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue trading rules for one instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentRules {
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
}

/// Limit order request handed to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrder {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub reduce_only: bool,
}

/// What the venue confirmed for a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_ref: String,
    pub confirmed_qty: Decimal,
    pub confirmed_price: Decimal,
}

/// One execution belonging to an order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
}

impl Fill {
    /// Signed cash flow of this execution: selling brings cash in, buying pays it out.
    pub fn realized_pnl_contribution(&self) -> Decimal {
        let notional = self.price * self.qty;
        match self.side {
            Side::Sell => notional,
            Side::Buy => -notional,
        }
    }
}

/// Funding settled on the account. Positive `fee` is paid, negative is received.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingAccrual {
    pub time: DateTime<Utc>,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equity {
    pub total: Decimal,
    pub available: Decimal,
}
