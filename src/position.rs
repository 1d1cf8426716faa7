use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::scheduler::ScheduledEntry;
use crate::timer::TimerHandle;
use crate::types::Side;

/// A position opened ahead of a funding event.
///
/// Quantity and entry price come from the venue's confirmation and never change;
/// only the exit order references grow while closing.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub event_time: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub entry_order_ref: String,
    pub exit_order_refs: Vec<String>,
    pub close_timer: Option<TimerHandle>,
}

impl OpenPosition {
    pub fn close_side(&self) -> Side {
        self.side.opposite()
    }

    /// Entry order first, then every distinct exit order.
    pub fn order_refs(&self) -> Vec<String> {
        let mut refs = vec![self.entry_order_ref.clone()];
        for r in &self.exit_order_refs {
            if !refs.contains(r) {
                refs.push(r.clone());
            }
        }
        refs
    }
}

/// Everything the engine knows about one symbol. No slot means unarmed.
#[derive(Debug)]
pub enum SymbolSlot {
    Armed(ScheduledEntry),
    Opening,
    Open(OpenPosition),
    Closing(OpenPosition),
}

impl SymbolSlot {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolSlot::Armed(_) => "armed",
            SymbolSlot::Opening => "opening",
            SymbolSlot::Open(_) => "open",
            SymbolSlot::Closing(_) => "closing",
        }
    }
}

/// Owned per-symbol table. A symbol holds at most one slot, so it can never
/// have both a scheduled entry and an open position.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: HashMap<String, SymbolSlot>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    pub armed: usize,
    pub opening: usize,
    pub open: usize,
    pub closing: usize,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSlot> {
        self.slots.get(symbol)
    }

    /// Install or replace a scheduled entry. Refused while the symbol is opening,
    /// open or closing. A replaced timer is cancelled.
    pub fn arm(&mut self, entry: ScheduledEntry) -> bool {
        match self.slots.get(&entry.symbol) {
            None => {}
            Some(SymbolSlot::Armed(previous)) => {
                previous.timer.cancel();
                debug!(
                    "{}: replacing armed timer for {} with {}",
                    entry.symbol, previous.event_time, entry.event_time
                );
            }
            Some(other) => {
                debug!("{}: not arming, slot is {}", entry.symbol, other.label());
                return false;
            }
        }
        self.slots
            .insert(entry.symbol.clone(), SymbolSlot::Armed(entry));
        true
    }

    /// Remove and cancel a scheduled entry. No-op for any other state.
    pub fn disarm(&mut self, symbol: &str) -> bool {
        if let Some(SymbolSlot::Armed(_)) = self.slots.get(symbol) {
            if let Some(SymbolSlot::Armed(entry)) = self.slots.remove(symbol) {
                entry.timer.cancel();
                return true;
            }
        }
        false
    }

    /// Claim an armed slot for a firing entry timer. Succeeds only if the slot is
    /// still armed by exactly this timer.
    pub fn claim_fired_entry(&mut self, symbol: &str, timer_id: u64) -> bool {
        match self.slots.get(symbol) {
            Some(SymbolSlot::Armed(entry)) if entry.timer.id() == timer_id => {
                self.slots.insert(symbol.to_string(), SymbolSlot::Opening);
                true
            }
            _ => false,
        }
    }

    /// Drop an armed entry whose timer fired but may no longer act. The timer is
    /// the caller, so it is not cancelled.
    pub fn expire_fired_entry(&mut self, symbol: &str, timer_id: u64) -> bool {
        match self.slots.get(symbol) {
            Some(SymbolSlot::Armed(entry)) if entry.timer.id() == timer_id => {
                self.slots.remove(symbol);
                true
            }
            _ => false,
        }
    }

    /// Mark an unarmed symbol as opening (immediate fire, no timer).
    pub fn begin_open(&mut self, symbol: &str) -> bool {
        if self.slots.contains_key(symbol) {
            return false;
        }
        self.slots.insert(symbol.to_string(), SymbolSlot::Opening);
        true
    }

    /// Drop the opening marker after a skipped or failed entry.
    pub fn abandon_open(&mut self, symbol: &str) {
        if let Some(SymbolSlot::Opening) = self.slots.get(symbol) {
            self.slots.remove(symbol);
        }
    }

    /// Opening -> Open.
    pub fn install_position(&mut self, position: OpenPosition) -> bool {
        match self.slots.get(&position.symbol) {
            Some(SymbolSlot::Opening) => {
                info!(
                    "{}: position open {} {} @ {}",
                    position.symbol, position.side, position.qty, position.entry_price
                );
                self.slots
                    .insert(position.symbol.clone(), SymbolSlot::Open(position));
                true
            }
            _ => false,
        }
    }

    /// Attach the close timer to an open position.
    pub fn set_close_timer(&mut self, symbol: &str, timer: TimerHandle) {
        match self.slots.get_mut(symbol) {
            Some(SymbolSlot::Open(position)) => position.close_timer = Some(timer),
            _ => timer.cancel(),
        }
    }

    /// Open -> Closing. With `timer_id`, only the matching close timer may claim
    /// it; without, the close timer is cancelled. Returns the position to close.
    pub fn begin_close(&mut self, symbol: &str, timer_id: Option<u64>) -> Option<OpenPosition> {
        let claimable = match self.slots.get(symbol) {
            Some(SymbolSlot::Open(position)) => match timer_id {
                Some(id) => position.close_timer.as_ref().map(|t| t.id()) == Some(id),
                None => true,
            },
            _ => false,
        };
        if !claimable {
            return None;
        }

        match self.slots.remove(symbol) {
            Some(SymbolSlot::Open(mut position)) => {
                if let Some(timer) = position.close_timer.take() {
                    if timer_id.is_none() {
                        timer.cancel();
                    }
                }
                self.slots
                    .insert(symbol.to_string(), SymbolSlot::Closing(position.clone()));
                Some(position)
            }
            Some(other) => {
                self.slots.insert(symbol.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Remember an exit order on a closing position (duplicates ignored).
    pub fn record_exit_order(&mut self, symbol: &str, order_ref: &str) {
        if let Some(SymbolSlot::Closing(position)) = self.slots.get_mut(symbol) {
            if !position.exit_order_refs.iter().any(|r| r == order_ref) {
                position.exit_order_refs.push(order_ref.to_string());
            }
        }
    }

    pub fn closing_position(&self, symbol: &str) -> Option<OpenPosition> {
        match self.slots.get(symbol) {
            Some(SymbolSlot::Closing(position)) => Some(position.clone()),
            _ => None,
        }
    }

    /// Forget the symbol whatever its state.
    pub fn release(&mut self, symbol: &str) -> Option<SymbolSlot> {
        self.slots.remove(symbol)
    }

    /// Cancel and remove every scheduled entry.
    pub fn drain_armed(&mut self) -> Vec<String> {
        let armed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, SymbolSlot::Armed(_)))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in &armed {
            self.disarm(symbol);
        }
        armed
    }

    /// Cancel and detach the close timer of every open position. A detached
    /// timer that is already firing finds no matching id and stands down.
    pub fn cancel_close_timers(&mut self) -> usize {
        let mut cancelled = 0;
        for slot in self.slots.values_mut() {
            if let SymbolSlot::Open(position) = slot {
                if let Some(timer) = position.close_timer.take() {
                    timer.cancel();
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, SymbolSlot::Open(_)))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for slot in self.slots.values() {
            match slot {
                SymbolSlot::Armed(_) => counts.armed += 1,
                SymbolSlot::Opening => counts.opening += 1,
                SymbolSlot::Open(_) => counts.open += 1,
                SymbolSlot::Closing(_) => counts.closing += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::spawn_at;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn idle_timer() -> TimerHandle {
        spawn_at(Utc::now() + Duration::hours(1), |_| async {})
    }

    fn entry(symbol: &str, event_time: DateTime<Utc>) -> ScheduledEntry {
        ScheduledEntry {
            symbol: symbol.to_string(),
            event_time,
            timer: idle_timer(),
        }
    }

    fn position(symbol: &str) -> OpenPosition {
        OpenPosition {
            symbol: symbol.to_string(),
            side: Side::Sell,
            qty: dec!(2),
            entry_price: dec!(50),
            event_time: Utc::now(),
            opened_at: Utc::now(),
            entry_order_ref: "entry".to_string(),
            exit_order_refs: vec![],
            close_timer: None,
        }
    }

    #[tokio::test]
    async fn test_cannot_arm_while_position_open() {
        let mut table = SlotTable::new();
        assert!(table.begin_open("XUSDT"));
        assert!(table.install_position(position("XUSDT")));

        assert!(!table.arm(entry("XUSDT", Utc::now())));
        assert!(matches!(table.get("XUSDT"), Some(SymbolSlot::Open(_))));
    }

    #[tokio::test]
    async fn test_stale_timer_cannot_claim_replaced_entry() {
        let mut table = SlotTable::new();
        let first = entry("XUSDT", Utc::now() + Duration::seconds(4));
        let stale_id = first.timer.id();
        table.arm(first);
        let second = entry("XUSDT", Utc::now() + Duration::seconds(8));
        let live_id = second.timer.id();
        table.arm(second);

        assert!(!table.claim_fired_entry("XUSDT", stale_id));
        assert!(table.claim_fired_entry("XUSDT", live_id));
        assert!(matches!(table.get("XUSDT"), Some(SymbolSlot::Opening)));
        // A second fire of the same timer is rejected.
        assert!(!table.claim_fired_entry("XUSDT", live_id));
    }

    #[tokio::test]
    async fn test_disarm_is_idempotent() {
        let mut table = SlotTable::new();
        table.arm(entry("XUSDT", Utc::now()));
        assert!(table.disarm("XUSDT"));
        assert!(!table.disarm("XUSDT"));
        assert!(table.get("XUSDT").is_none());
    }

    #[tokio::test]
    async fn test_begin_close_claims_once() {
        let mut table = SlotTable::new();
        table.begin_open("XUSDT");
        table.install_position(position("XUSDT"));

        assert!(table.begin_close("XUSDT", None).is_some());
        assert!(table.begin_close("XUSDT", None).is_none());

        table.record_exit_order("XUSDT", "exit-1");
        table.record_exit_order("XUSDT", "exit-1");
        table.record_exit_order("XUSDT", "exit-2");
        let closing = table.closing_position("XUSDT").unwrap();
        assert_eq!(closing.order_refs(), vec!["entry", "exit-1", "exit-2"]);
    }

    #[tokio::test]
    async fn test_close_timer_id_must_match() {
        let mut table = SlotTable::new();
        table.begin_open("XUSDT");
        table.install_position(position("XUSDT"));
        let timer = idle_timer();
        let id = timer.id();
        table.set_close_timer("XUSDT", timer);

        assert!(table.begin_close("XUSDT", Some(id + 1000)).is_none());
        assert!(table.begin_close("XUSDT", Some(id)).is_some());
    }

    #[tokio::test]
    async fn test_drain_armed_leaves_positions() {
        let mut table = SlotTable::new();
        table.arm(entry("AUSDT", Utc::now()));
        table.arm(entry("BUSDT", Utc::now()));
        table.begin_open("CUSDT");
        table.install_position(position("CUSDT"));

        let mut drained = table.drain_armed();
        drained.sort();
        assert_eq!(drained, vec!["AUSDT", "BUSDT"]);
        assert_eq!(
            table.counts(),
            SlotCounts {
                armed: 0,
                opening: 0,
                open: 1,
                closing: 0
            }
        );
        assert_eq!(table.open_symbols(), vec!["CUSDT"]);
    }

    #[tokio::test]
    async fn test_cancelled_close_timer_can_no_longer_claim() {
        let mut table = SlotTable::new();
        table.begin_open("XUSDT");
        table.install_position(position("XUSDT"));
        let timer = idle_timer();
        let id = timer.id();
        table.set_close_timer("XUSDT", timer);

        assert_eq!(table.cancel_close_timers(), 1);
        assert_eq!(table.cancel_close_timers(), 0);
        assert!(table.begin_close("XUSDT", Some(id)).is_none());
        assert!(table.begin_close("XUSDT", None).is_some());
    }
}
