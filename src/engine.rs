//! The trading engine: owns the market book and the per-symbol slot table,
//! drives polling, and applies arming decisions.
//!
//! The binary runs on a single-threaded runtime. Per-symbol work runs in spawned
//! tasks that only interleave at `.await` points; there is no ordering between
//! symbols. Locks here are never held across an await.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::alerts::AlertClient;
use crate::config::StrategyConfig;
use crate::gateway::ExchangeGateway;
use crate::poller::MarketBook;
use crate::position::SlotTable;
use crate::risk::RiskGuard;
use crate::scheduler::{decide, plan, ArmDecision, ScheduleAction, ScheduledEntry};
use crate::timer;

/// How often shutdown reports opens and closes it is still waiting on.
const DRAIN_REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Engine {
    pub(crate) config: StrategyConfig,
    pub(crate) gateway: Arc<dyn ExchangeGateway>,
    pub(crate) risk: RiskGuard,
    pub(crate) alerts: Arc<AlertClient>,
    pub(crate) book: Mutex<MarketBook>,
    pub(crate) slots: Mutex<SlotTable>,
    /// Event time of the last immediate entry per symbol.
    immediate_fires: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown_started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    halted_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: StrategyConfig,
        gateway: Arc<dyn ExchangeGateway>,
        risk: RiskGuard,
        alerts: Arc<AlertClient>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (halted_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            gateway,
            risk,
            alerts,
            book: Mutex::new(MarketBook::new()),
            slots: Mutex::new(SlotTable::new()),
            immediate_fires: Mutex::new(HashMap::new()),
            shutdown_started: AtomicBool::new(false),
            stop_tx,
            halted_tx,
        })
    }

    pub fn risk(&self) -> &RiskGuard {
        &self.risk
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Poll and monitor until shutdown stops them.
    pub async fn run(self: &Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow() {
            return;
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut monitor = tokio::time::interval(self.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Engine running: poll every {:?}, top {}, threshold {}",
            self.config.poll_interval, self.config.top_n, self.config.funding_threshold
        );

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = poll.tick() => self.poll_cycle().await,
                _ = monitor.tick() => self.log_status(),
            }
        }
        info!("Poll loop stopped");
    }

    /// Resolves once shutdown has finished.
    pub async fn wait_halted(&self) {
        let mut halted = self.halted_tx.subscribe();
        let _ = halted.wait_for(|done| *done).await;
    }

    /// One poll: refresh snapshots, reselect, disarm dropped symbols, arm or fire
    /// the qualifying ones. A failed fetch skips the cycle.
    pub async fn poll_cycle(self: &Arc<Self>) {
        if !self.accepting_entries() {
            return;
        }

        let batch = match self.gateway.list_instrument_snapshots().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Snapshot poll failed, skipping cycle: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let (dropped, decisions) = {
            let mut book = self.book.lock();
            let stored = book.ingest(batch);
            let change = book.reselect(self.config.top_n);
            debug!("Poll stored {} snapshots, selected {:?}", stored, change.selected);
            let decisions: Vec<(String, ArmDecision)> = change
                .selected
                .iter()
                .filter_map(|symbol| {
                    book.get(symbol)
                        .map(|snapshot| (symbol.clone(), decide(snapshot, now, &self.config)))
                })
                .collect();
            (change.dropped, decisions)
        };

        // Trading may have been switched off while the fetch was in flight.
        if !self.accepting_entries() {
            return;
        }

        for symbol in &dropped {
            if self.slots.lock().disarm(symbol) {
                info!("{}: left the selection, entry disarmed", symbol);
            }
        }
        for (symbol, decision) in decisions {
            self.apply_decision(&symbol, decision);
        }
    }

    fn apply_decision(self: &Arc<Self>, symbol: &str, decision: ArmDecision) {
        let mut slots = self.slots.lock();
        match plan(slots.get(symbol), decision) {
            ScheduleAction::Keep => {}
            ScheduleAction::Disarm => {
                slots.disarm(symbol);
                info!("{}: no longer qualifies ({:?}), entry disarmed", symbol, decision);
            }
            ScheduleAction::Arm { fire_at, event_time } => {
                let engine = Arc::clone(self);
                let owned = symbol.to_string();
                let timer = timer::spawn_at(fire_at, move |id| async move {
                    engine.on_entry_timer(&owned, id).await;
                });
                if slots.arm(ScheduledEntry {
                    symbol: symbol.to_string(),
                    event_time,
                    timer: timer.clone(),
                }) {
                    info!("{}: entry armed for {} (event {})", symbol, timer.deadline(), event_time);
                } else {
                    timer.cancel();
                }
            }
            ScheduleAction::FireNow { event_time } => {
                slots.disarm(symbol);
                if slots.begin_open(symbol) {
                    let previous = self.immediate_fires.lock().insert(symbol.to_string(), event_time);
                    if previous == Some(event_time) {
                        debug!(
                            "{}: repeating immediate entry for event {}, the previous attempt did not open",
                            symbol, event_time
                        );
                    }
                    info!("{}: fire time passed, entering now (event {})", symbol, event_time);
                    let engine = Arc::clone(self);
                    let owned = symbol.to_string();
                    tokio::spawn(async move {
                        engine.open_position(owned).await;
                    });
                }
            }
        }
    }

    /// Entry timer fired. Acts only if this timer still owns the slot, the symbol
    /// is still selected and trading is enabled.
    async fn on_entry_timer(self: &Arc<Self>, symbol: &str, timer_id: u64) {
        let claimed = {
            let still_selected = self.book.lock().is_selected(symbol);
            let mut slots = self.slots.lock();
            if !self.accepting_entries() || !still_selected {
                slots.expire_fired_entry(symbol, timer_id);
                false
            } else {
                slots.claim_fired_entry(symbol, timer_id)
            }
        };

        if claimed {
            self.open_position(symbol.to_string()).await;
        } else {
            debug!("{}: stale entry timer {} ignored", symbol, timer_id);
        }
    }

    pub(crate) fn accepting_entries(&self) -> bool {
        self.risk.trading_enabled() && !self.is_shutting_down()
    }

    fn log_status(&self) {
        let counts = self.slots.lock().counts();
        let selected = self.book.lock().selection().len();
        info!(
            "Status: selected={} armed={} opening={} open={} closing={} trades={} net_pnl={} trading={}",
            selected,
            counts.armed,
            counts.opening,
            counts.open,
            counts.closing,
            self.risk.trade_count(),
            self.risk.cumulative_net_pnl(),
            if self.risk.trading_enabled() { "on" } else { "off" }
        );
    }

    /// Orderly halt: stop polling, cancel armed entries, close every open position
    /// one at a time, then report. Later calls return false and do nothing.
    pub async fn shutdown(&self, reason: &str) -> bool {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already started, ignoring ({})", reason);
            return false;
        }
        warn!("Shutting down: {}", reason);

        self.risk.disable_trading();
        self.stop_tx.send_replace(true);

        let cancelled = self.slots.lock().drain_armed();
        if !cancelled.is_empty() {
            info!("Cancelled armed entries: {:?}", cancelled);
        }

        // Only the sweep below may close from here on.
        let open = {
            let mut slots = self.slots.lock();
            slots.cancel_close_timers();
            slots.open_symbols()
        };
        for symbol in open {
            let position = self.slots.lock().begin_close(&symbol, None);
            if let Some(position) = position {
                info!("{}: closing on shutdown", symbol);
                self.close_and_finalize(position).await;
            }
        }

        self.wait_for_in_flight().await;

        self.halted_tx.send_replace(true);
        self.alerts.shutdown_complete(reason).await;
        info!("Shutdown complete ({})", reason);
        true
    }

    /// Wait for every in-flight open and close to finish. There is no cap: the
    /// closes bound themselves through their attempt limit.
    async fn wait_for_in_flight(&self) {
        let mut next_report = tokio::time::Instant::now() + DRAIN_REPORT_INTERVAL;
        loop {
            let counts = self.slots.lock().counts();
            if counts.opening + counts.closing == 0 {
                return;
            }
            if tokio::time::Instant::now() >= next_report {
                warn!(
                    "Shutdown waiting on {} opening / {} closing",
                    counts.opening, counts.closing
                );
                next_report += DRAIN_REPORT_INTERVAL;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}
