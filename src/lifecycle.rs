//! Position lifecycle: entry at the pre-event fire time, retry-until-flat exit
//! after the event, and finalization into a trade summary.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::EntryError;
use crate::pnl::{funding_in_window, funding_query_range, trade_pnl, ClosedTradeSummary};
use crate::position::OpenPosition;
use crate::risk::RiskVerdict;
use crate::scheduler::meets_threshold;
use crate::sizing::{round_to_step, size_for_notional};
use crate::timer;
use crate::types::{InstrumentSnapshot, LimitOrder, Side};

/// Clears a symbol's slot when dropped, so finalize can never leave a stuck
/// record behind, whatever path it exits through.
struct SlotRelease<'a> {
    engine: &'a Engine,
    symbol: String,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.engine.slots.lock().release(&self.symbol);
        debug!("{}: slot released", self.symbol);
    }
}

impl Engine {
    /// Run an entry for a symbol already marked as opening.
    pub(crate) async fn open_position(self: &Arc<Self>, symbol: String) {
        let position = match self.try_open(&symbol).await {
            Ok(position) => position,
            Err(e) => {
                match &e {
                    EntryError::Gateway(_) => warn!("{}: entry failed: {}", symbol, e),
                    _ => info!("{}: entry skipped: {}", symbol, e),
                }
                self.slots.lock().abandon_open(&symbol);
                return;
            }
        };

        let (side, qty, price, event_time) =
            (position.side, position.qty, position.entry_price, position.event_time);
        if !self.slots.lock().install_position(position) {
            error!("{}: opening marker vanished during entry", symbol);
            return;
        }

        if !self.accepting_entries() {
            // Shutdown may already have swept open positions; close this one here.
            let position = self.slots.lock().begin_close(&symbol, None);
            if let Some(position) = position {
                info!("{}: trading halted during entry, closing immediately", symbol);
                self.close_and_finalize(position).await;
            }
            return;
        }

        let close_at = std::cmp::max(event_time + self.config.post_offset, Utc::now());
        let engine = Arc::clone(self);
        let owned = symbol.clone();
        let close_timer = timer::spawn_at(close_at, move |id| async move {
            engine.on_close_timer(&owned, id).await;
        });
        self.slots.lock().set_close_timer(&symbol, close_timer);
        info!("{}: exit scheduled for {}", symbol, close_at);

        self.alerts.position_opened(&symbol, side, qty, price).await;
    }

    async fn try_open(&self, symbol: &str) -> Result<OpenPosition, EntryError> {
        let snapshot = self.refresh_snapshot(symbol).await.ok_or(EntryError::NoSnapshot)?;

        let rate = snapshot.funding_rate.ok_or(EntryError::NoSnapshot)?;
        if !meets_threshold(rate, self.config.funding_threshold) {
            return Err(EntryError::BelowThreshold {
                rate,
                threshold: self.config.funding_threshold,
            });
        }
        let event_time = snapshot
            .next_event_time
            .filter(|t| *t > Utc::now())
            .ok_or(EntryError::EventPassed)?;

        let side = Side::for_funding_rate(rate);
        let reference = snapshot.reference_price().ok_or(EntryError::NoReferencePrice)?;
        let rules = self.gateway.get_instrument_rules(symbol).await?;
        let qty = size_for_notional(self.config.notional_usd, reference, &rules)?;
        let price = round_to_step(reference, rules.tick_size);

        if !self.accepting_entries() {
            return Err(EntryError::TradingDisabled);
        }

        info!(
            "{}: entering {} {} @ {} (funding {}, event {})",
            symbol, side, qty, price, rate, event_time
        );
        let ack = self
            .gateway
            .place_limit_order(&LimitOrder {
                symbol: symbol.to_string(),
                side,
                price,
                qty,
                reduce_only: false,
            })
            .await?;

        Ok(OpenPosition {
            symbol: symbol.to_string(),
            side,
            qty: ack.confirmed_qty,
            entry_price: ack.confirmed_price,
            event_time,
            opened_at: Utc::now(),
            entry_order_ref: ack.order_ref,
            exit_order_refs: Vec::new(),
            close_timer: None,
        })
    }

    /// Fresh snapshot from the venue, falling back to the cached one.
    async fn refresh_snapshot(&self, symbol: &str) -> Option<InstrumentSnapshot> {
        match self.gateway.get_snapshot(symbol).await {
            Ok(Some(snapshot)) => {
                self.book.lock().update(snapshot.clone());
                return Some(snapshot);
            }
            Ok(None) => warn!("{}: venue returned no snapshot, using cached", symbol),
            Err(e) => warn!("{}: snapshot refresh failed, using cached: {}", symbol, e),
        }
        self.book.lock().get(symbol).cloned()
    }

    pub(crate) async fn on_close_timer(&self, symbol: &str, timer_id: u64) {
        let position = self.slots.lock().begin_close(symbol, Some(timer_id));
        let Some(position) = position else {
            debug!("{}: stale close timer {} ignored", symbol, timer_id);
            return;
        };

        if let RiskVerdict::Breached { first: true, .. } = self.close_and_finalize(position).await {
            self.shutdown("risk limit breached").await;
        }
    }

    /// Close to flat, finalize, release the slot, then run the risk check.
    pub(crate) async fn close_and_finalize(&self, position: OpenPosition) -> RiskVerdict {
        let symbol = position.symbol.clone();
        let (summary, equity) = {
            let _release = SlotRelease {
                engine: self,
                symbol: symbol.clone(),
            };
            let residual = self.close_position(&position).await;
            let position = self.slots.lock().closing_position(&symbol).unwrap_or(position);
            self.finalize(&position, residual).await
        };

        let verdict = self.risk.record_trade(&summary, equity);
        if let RiskVerdict::Breached {
            loss,
            limit,
            first: true,
        } = verdict
        {
            self.alerts.risk_breach(loss, limit).await;
        }
        verdict
    }

    /// Up to `close_max_attempts` reduce-only orders for whatever is still open,
    /// a fixed delay apart. Returns the size still open afterwards.
    pub(crate) async fn close_position(&self, position: &OpenPosition) -> Decimal {
        let symbol = position.symbol.as_str();
        let close_side = position.close_side();
        let max_attempts = self.config.close_max_attempts;
        let mut remaining = position.qty;

        for attempt in 1..=max_attempts {
            match self.gateway.get_open_quantity(symbol).await {
                Ok(qty) => remaining = qty,
                Err(e) => {
                    warn!("{}: close attempt {}/{} could not read position: {}", symbol, attempt, max_attempts, e);
                    tokio::time::sleep(self.config.close_retry_delay).await;
                    continue;
                }
            }
            if remaining.is_zero() {
                info!("{}: flat after {} attempt(s)", symbol, attempt - 1);
                return Decimal::ZERO;
            }

            let price = self.closing_price(symbol, close_side, position.entry_price).await;
            info!(
                "{}: close attempt {}/{}: {} {} @ {}",
                symbol, attempt, max_attempts, close_side, remaining, price
            );
            match self
                .gateway
                .place_limit_order(&LimitOrder {
                    symbol: symbol.to_string(),
                    side: close_side,
                    price,
                    qty: remaining,
                    reduce_only: true,
                })
                .await
            {
                Ok(ack) => self.slots.lock().record_exit_order(symbol, &ack.order_ref),
                Err(e) => warn!("{}: close order rejected: {}", symbol, e),
            }

            tokio::time::sleep(self.config.close_retry_delay).await;
        }

        match self.gateway.get_open_quantity(symbol).await {
            Ok(qty) => remaining = qty,
            Err(e) => warn!("{}: final position check failed: {}", symbol, e),
        }
        if !remaining.is_zero() {
            error!(
                "{}: {} still open after {} close attempts",
                symbol, remaining, max_attempts
            );
            self.alerts.residual_position(symbol, remaining).await;
        }
        remaining
    }

    async fn closing_price(&self, symbol: &str, close_side: Side, entry_price: Decimal) -> Decimal {
        self.refresh_snapshot(symbol)
            .await
            .and_then(|snapshot| snapshot.closing_price(close_side))
            .unwrap_or(entry_price)
    }

    /// Collect fills and funding for the trade and build its summary. Every
    /// gateway failure degrades to a zero contribution.
    async fn finalize(
        &self,
        position: &OpenPosition,
        residual: Decimal,
    ) -> (ClosedTradeSummary, Option<Decimal>) {
        let symbol = position.symbol.as_str();
        let closed_at = Utc::now();

        let mut fills = Vec::new();
        for order_ref in position.order_refs() {
            match self.gateway.get_fills(symbol, &order_ref).await {
                Ok(order_fills) => fills.extend(order_fills),
                Err(e) => warn!("{}: fills for order {} unavailable: {}", symbol, order_ref, e),
            }
        }
        let (gross, fees) = trade_pnl(&fills, position.side, residual, position.entry_price);

        let window = &self.config.funding_window;
        let (from, to) = funding_query_range(position.opened_at, closed_at, window);
        let funding_fee = match self
            .gateway
            .get_funding_accruals(symbol, &self.config.settle_coin, from, to)
            .await
        {
            Ok(accruals) => funding_in_window(&accruals, position.opened_at, closed_at, window),
            Err(e) => {
                warn!("{}: funding history unavailable: {}", symbol, e);
                Decimal::ZERO
            }
        };

        let equity = match self.gateway.get_account_equity(&self.config.settle_coin).await {
            Ok(equity) => Some(equity.total),
            Err(e) => {
                warn!("{}: balance read failed: {}", symbol, e);
                None
            }
        };

        let mut summary = ClosedTradeSummary::new(symbol, gross, fees, funding_fee);
        summary.residual_qty = residual;
        summary.equity_delta = equity.map(|e| e - self.risk.starting_equity());

        info!(
            "{}: closed. gross={} fees={} funding={} net={} equity_delta={:?}",
            symbol, summary.gross_pnl, summary.fees, summary.funding_fee, summary.net_pnl, summary.equity_delta
        );
        if summary.has_residual() {
            warn!(
                "{}: summary values residual {} at entry price {}",
                symbol, summary.residual_qty, position.entry_price
            );
        }
        self.alerts.position_closed(&summary).await;
        (summary, equity)
    }
}
