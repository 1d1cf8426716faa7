use rust_decimal::Decimal;
use thiserror::Error;

/// Failures coming back from the exchange gateway.
///
/// None of these are fatal: callers log them and treat the step as "no progress".
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("Rejected by venue (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Parse(e.to_string())
    }
}

/// Reasons an entry is skipped.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("funding rate {rate} no longer meets threshold {threshold}")]
    BelowThreshold { rate: Decimal, threshold: Decimal },

    #[error("funding event already passed")]
    EventPassed,

    #[error("trading disabled")]
    TradingDisabled,

    #[error("no snapshot available")]
    NoSnapshot,

    #[error("no reference price available")]
    NoReferencePrice,

    #[error("conformed quantity {qty} below venue minimum {min_qty}")]
    BelowMinimum { qty: Decimal, min_qty: Decimal },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
