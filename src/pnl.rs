use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::FundingWindow;
use crate::types::{Fill, FundingAccrual, Side};

/// Result of one closed trade. Reported, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTradeSummary {
    pub symbol: String,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub funding_fee: Decimal,
    pub net_pnl: Decimal,
    /// Fresh equity minus starting equity, when the balance read succeeded.
    pub equity_delta: Option<Decimal>,
    /// Size still open after the close attempts ran out.
    pub residual_qty: Decimal,
}

impl ClosedTradeSummary {
    pub fn new(symbol: &str, gross_pnl: Decimal, fees: Decimal, funding_fee: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            gross_pnl,
            fees,
            funding_fee,
            net_pnl: net_pnl(gross_pnl, fees, funding_fee),
            equity_delta: None,
            residual_qty: Decimal::ZERO,
        }
    }

    pub fn has_residual(&self) -> bool {
        !self.residual_qty.is_zero()
    }
}

pub fn net_pnl(gross: Decimal, fees: Decimal, funding_fee: Decimal) -> Decimal {
    gross - fees - funding_fee
}

/// Sum of signed fill cash flows and of fees.
///
/// A residual position is valued at the entry price so an incomplete exit does
/// not show up as a loss of the whole entry notional.
pub fn trade_pnl(
    fills: &[Fill],
    position_side: Side,
    residual_qty: Decimal,
    entry_price: Decimal,
) -> (Decimal, Decimal) {
    let cash: Decimal = fills.iter().map(Fill::realized_pnl_contribution).sum();
    let fees: Decimal = fills.iter().map(|f| f.fee).sum();
    let residual_value = residual_qty.abs() * entry_price;
    let held = match position_side {
        Side::Buy => residual_value,
        Side::Sell => -residual_value,
    };
    (cash + held, fees)
}

/// Query bounds for funding settlements around a holding period.
pub fn funding_query_range(
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
    window: &FundingWindow,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (opened_at - window.query_pad, closed_at + window.query_pad)
}

/// Funding paid over the trade: settlements between open minus the open grace
/// and close plus the close grace.
pub fn funding_in_window(
    accruals: &[FundingAccrual],
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
    window: &FundingWindow,
) -> Decimal {
    let from = opened_at - window.open_grace;
    let to = closed_at + window.close_grace;
    accruals
        .iter()
        .filter(|a| a.time >= from && a.time <= to)
        .map(|a| a.fee)
        .sum()
}
