use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::pnl::ClosedTradeSummary;

/// How the accountant decides to stop trading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HaltModel {
    /// Halt when starting equity minus current equity reaches
    /// `limit_fraction` of starting equity.
    Drawdown { limit_fraction: Decimal },
    /// Halt when cumulative net PnL reaches `-stop_fraction * notional_usd`.
    CumulativePnl {
        stop_fraction: Decimal,
        notional_usd: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Within,
    /// Limit reached. `first` is true only for the caller that flipped the latch.
    Breached {
        loss: Decimal,
        limit: Decimal,
        first: bool,
    },
}

/// One-way trading kill switch plus the numbers it watches.
pub struct RiskGuard {
    starting_equity: Decimal,
    model: HaltModel,
    trading_enabled: AtomicBool,
    cumulative_net_pnl: Mutex<Decimal>,
    trades: Mutex<u32>,
}

impl RiskGuard {
    /// `starting_equity` is captured once, at process start.
    pub fn new(starting_equity: Decimal, model: HaltModel) -> Self {
        info!("Risk guard armed: starting equity {}, model {:?}", starting_equity, model);
        Self {
            starting_equity,
            model,
            trading_enabled: AtomicBool::new(true),
            cumulative_net_pnl: Mutex::new(Decimal::ZERO),
            trades: Mutex::new(0),
        }
    }

    pub fn starting_equity(&self) -> Decimal {
        self.starting_equity
    }

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    pub fn cumulative_net_pnl(&self) -> Decimal {
        *self.cumulative_net_pnl.lock()
    }

    pub fn trade_count(&self) -> u32 {
        *self.trades.lock()
    }

    /// Flip trading off. Returns true only for the call that actually flipped it.
    pub fn disable_trading(&self) -> bool {
        self.trading_enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Drawdown limit in account currency.
    pub fn drawdown_limit(&self) -> Option<Decimal> {
        match self.model {
            HaltModel::Drawdown { limit_fraction } => Some(self.starting_equity * limit_fraction),
            HaltModel::CumulativePnl { .. } => None,
        }
    }

    /// Book a finalized trade and check the limit. Runs once per trade, after
    /// its result is known. `current_equity` is a fresh balance read, if any.
    pub fn record_trade(
        &self,
        summary: &ClosedTradeSummary,
        current_equity: Option<Decimal>,
    ) -> RiskVerdict {
        let cumulative = {
            let mut total = self.cumulative_net_pnl.lock();
            *total += summary.net_pnl;
            *total
        };
        *self.trades.lock() += 1;

        let (loss, limit) = match self.model {
            HaltModel::Drawdown { limit_fraction } => {
                let Some(equity) = current_equity else {
                    warn!("{}: no equity reading, drawdown check skipped", summary.symbol);
                    return RiskVerdict::Within;
                };
                (self.starting_equity - equity, self.starting_equity * limit_fraction)
            }
            HaltModel::CumulativePnl {
                stop_fraction,
                notional_usd,
            } => (-cumulative, stop_fraction * notional_usd),
        };

        if loss >= limit {
            let first = self.disable_trading();
            if first {
                warn!(
                    "RISK LIMIT BREACHED after {}: loss {} >= limit {}, trading disabled",
                    summary.symbol, loss, limit
                );
            }
            RiskVerdict::Breached { loss, limit, first }
        } else {
            RiskVerdict::Within
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(net: Decimal) -> ClosedTradeSummary {
        ClosedTradeSummary::new("XUSDT", net, Decimal::ZERO, Decimal::ZERO)
    }

    #[test]
    fn test_drawdown_breach_flips_once() {
        let guard = RiskGuard::new(dec!(1000), HaltModel::Drawdown { limit_fraction: dec!(0.03) });
        assert_eq!(guard.drawdown_limit(), Some(dec!(30)));

        assert_eq!(guard.record_trade(&trade(dec!(-10)), Some(dec!(990))), RiskVerdict::Within);
        assert!(guard.trading_enabled());

        let first = guard.record_trade(&trade(dec!(-25)), Some(dec!(965)));
        assert_eq!(
            first,
            RiskVerdict::Breached {
                loss: dec!(35),
                limit: dec!(30),
                first: true
            }
        );
        assert!(!guard.trading_enabled());

        let second = guard.record_trade(&trade(dec!(0)), Some(dec!(965)));
        assert!(matches!(second, RiskVerdict::Breached { first: false, .. }));
        assert!(!guard.trading_enabled());
    }

    #[test]
    fn test_drawdown_without_equity_reading_is_not_a_breach() {
        let guard = RiskGuard::new(dec!(1000), HaltModel::Drawdown { limit_fraction: dec!(0.03) });
        assert_eq!(guard.record_trade(&trade(dec!(-500)), None), RiskVerdict::Within);
        assert!(guard.trading_enabled());
        assert_eq!(guard.trade_count(), 1);
    }

    #[test]
    fn test_cumulative_pnl_model() {
        let guard = RiskGuard::new(
            dec!(1000),
            HaltModel::CumulativePnl {
                stop_fraction: dec!(0.5),
                notional_usd: dec!(100),
            },
        );
        assert_eq!(guard.record_trade(&trade(dec!(-30)), None), RiskVerdict::Within);
        assert_eq!(guard.record_trade(&trade(dec!(10)), None), RiskVerdict::Within);
        assert!(matches!(
            guard.record_trade(&trade(dec!(-30)), None),
            RiskVerdict::Breached { first: true, .. }
        ));
        assert_eq!(guard.cumulative_net_pnl(), dec!(-50));
    }

    #[test]
    fn test_disable_trading_is_one_way() {
        let guard = RiskGuard::new(dec!(1000), HaltModel::Drawdown { limit_fraction: dec!(0.03) });
        assert!(guard.disable_trading());
        assert!(!guard.disable_trading());
        assert!(!guard.trading_enabled());
    }
}
