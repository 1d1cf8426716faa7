//! Market snapshot book and top-N funding selection.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::types::InstrumentSnapshot;

/// Latest snapshot per symbol plus the current ranked selection.
#[derive(Debug, Default)]
pub struct MarketBook {
    snapshots: HashMap<String, InstrumentSnapshot>,
    selection: Vec<String>,
}

/// Result of a selection refresh.
#[derive(Debug, Default, PartialEq)]
pub struct SelectionChange {
    pub selected: Vec<String>,
    /// Symbols that were selected last cycle and no longer are.
    pub dropped: Vec<String>,
}

impl MarketBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored snapshots with a fresh batch. Entries without a funding
    /// rate are discarded. Returns how many were stored.
    pub fn ingest(&mut self, batch: Vec<InstrumentSnapshot>) -> usize {
        let mut stored = 0;
        for snapshot in batch {
            if snapshot.funding_rate.is_none() {
                debug!("Discarding {} snapshot without funding rate", snapshot.symbol);
                continue;
            }
            self.snapshots.insert(snapshot.symbol.clone(), snapshot);
            stored += 1;
        }
        stored
    }

    /// Replace one symbol's snapshot (used for the pre-entry refresh).
    pub fn update(&mut self, snapshot: InstrumentSnapshot) {
        if snapshot.funding_rate.is_some() {
            self.snapshots.insert(snapshot.symbol.clone(), snapshot);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&InstrumentSnapshot> {
        self.snapshots.get(symbol)
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    pub fn is_selected(&self, symbol: &str) -> bool {
        self.selection.iter().any(|s| s == symbol)
    }

    /// Recompute the top-N selection from the stored snapshots.
    pub fn reselect(&mut self, top_n: usize) -> SelectionChange {
        let selected: Vec<String> = select_top(self.snapshots.values(), top_n)
            .into_iter()
            .map(|s| s.symbol.clone())
            .collect();

        let keep: HashSet<&String> = selected.iter().collect();
        let dropped = self
            .selection
            .iter()
            .filter(|s| !keep.contains(s))
            .cloned()
            .collect();

        self.selection = selected.clone();
        SelectionChange { selected, dropped }
    }
}

/// Rank snapshots with a resolvable event time by descending |funding rate|,
/// ties by ascending event time, then symbol, and keep the first `top_n`.
pub fn select_top<'a, I>(snapshots: I, top_n: usize) -> Vec<&'a InstrumentSnapshot>
where
    I: IntoIterator<Item = &'a InstrumentSnapshot>,
{
    let mut ranked: Vec<&InstrumentSnapshot> = snapshots
        .into_iter()
        .filter(|s| s.next_event_time.is_some() && s.funding_rate.is_some())
        .collect();

    ranked.sort_by(|a, b| {
        b.abs_funding_rate()
            .cmp(&a.abs_funding_rate())
            .then_with(|| a.next_event_time.cmp(&b.next_event_time))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    ranked.truncate(top_n);
    ranked
}
