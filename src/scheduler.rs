//! Per-symbol entry arming decisions.
//!
//! A selected symbol moves UNARMED -> ARMED (timer set) -> FIRED (entry running)
//! and back to UNARMED. Deciding is pure; the engine applies the outcome to its
//! slot table and timers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::config::StrategyConfig;
use crate::position::SymbolSlot;
use crate::timer::TimerHandle;
use crate::types::InstrumentSnapshot;

/// A timed entry waiting for its fire time.
#[derive(Debug)]
pub struct ScheduledEntry {
    pub symbol: String,
    pub event_time: DateTime<Utc>,
    pub timer: TimerHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFundingRate,
    BelowThreshold,
    NoEventTime,
    EventPassed,
}

/// What the snapshot says about arming, ignoring current slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmDecision {
    Skip(SkipReason),
    /// Qualifies, but the fire time is more than one pre-offset window away.
    TooEarly { fire_at: DateTime<Utc> },
    Arm {
        fire_at: DateTime<Utc>,
        event_time: DateTime<Utc>,
    },
    /// Fire time already passed while the event is still ahead.
    FireNow { event_time: DateTime<Utc> },
}

impl ArmDecision {
    pub fn qualifies(&self) -> bool {
        matches!(self, ArmDecision::Arm { .. } | ArmDecision::FireNow { .. })
    }
}

pub fn meets_threshold(rate: Decimal, threshold: Decimal) -> bool {
    rate.abs() >= threshold
}

pub fn decide(snapshot: &InstrumentSnapshot, now: DateTime<Utc>, cfg: &StrategyConfig) -> ArmDecision {
    let Some(rate) = snapshot.funding_rate else {
        return ArmDecision::Skip(SkipReason::NoFundingRate);
    };
    if !meets_threshold(rate, cfg.funding_threshold) {
        return ArmDecision::Skip(SkipReason::BelowThreshold);
    }
    let Some(event_time) = snapshot.next_event_time else {
        return ArmDecision::Skip(SkipReason::NoEventTime);
    };
    if event_time <= now {
        return ArmDecision::Skip(SkipReason::EventPassed);
    }

    let fire_at = event_time - cfg.pre_offset;
    let wait = fire_at - now;
    if wait <= Duration::zero() {
        ArmDecision::FireNow { event_time }
    } else if wait > cfg.pre_offset {
        ArmDecision::TooEarly { fire_at }
    } else {
        ArmDecision::Arm { fire_at, event_time }
    }
}

/// What the engine should do with a symbol this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    /// Leave the slot alone.
    Keep,
    Disarm,
    Arm {
        fire_at: DateTime<Utc>,
        event_time: DateTime<Utc>,
    },
    FireNow { event_time: DateTime<Utc> },
}

/// Combine a decision with the symbol's current slot.
pub fn plan(slot: Option<&SymbolSlot>, decision: ArmDecision) -> ScheduleAction {
    match slot {
        Some(SymbolSlot::Opening) | Some(SymbolSlot::Open(_)) | Some(SymbolSlot::Closing(_)) => {
            ScheduleAction::Keep
        }
        Some(SymbolSlot::Armed(entry)) => match decision {
            ArmDecision::Arm { event_time, .. } | ArmDecision::FireNow { event_time }
                if event_time == entry.event_time =>
            {
                ScheduleAction::Keep
            }
            ArmDecision::Arm { fire_at, event_time } => ScheduleAction::Arm { fire_at, event_time },
            ArmDecision::FireNow { event_time } => ScheduleAction::FireNow { event_time },
            ArmDecision::TooEarly { .. } | ArmDecision::Skip(_) => ScheduleAction::Disarm,
        },
        None => match decision {
            ArmDecision::Arm { fire_at, event_time } => ScheduleAction::Arm { fire_at, event_time },
            ArmDecision::FireNow { event_time } => ScheduleAction::FireNow { event_time },
            ArmDecision::TooEarly { .. } | ArmDecision::Skip(_) => ScheduleAction::Keep,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::spawn_at;
    use rust_decimal_macros::dec;

    fn snap(rate: Option<Decimal>, event_time: Option<DateTime<Utc>>) -> InstrumentSnapshot {
        InstrumentSnapshot {
            symbol: "XUSDT".to_string(),
            funding_rate: rate,
            mark_price: Some(dec!(1)),
            last_price: None,
            bid_price: None,
            ask_price: None,
            next_event_time: event_time,
            event_interval_hours: None,
        }
    }

    #[test]
    fn test_arms_inside_pre_offset_window() {
        let cfg = StrategyConfig::default();
        let now = Utc::now();
        let event = now + Duration::seconds(8);
        assert_eq!(
            decide(&snap(Some(dec!(0.005)), Some(event)), now, &cfg),
            ArmDecision::Arm {
                fire_at: event - Duration::seconds(5),
                event_time: event
            }
        );
    }

    #[test]
    fn test_declines_when_wait_exceeds_window() {
        let cfg = StrategyConfig::default();
        let now = Utc::now();
        let decision = decide(&snap(Some(dec!(-0.02)), Some(now + Duration::seconds(11))), now, &cfg);
        assert!(matches!(decision, ArmDecision::TooEarly { .. }));
        assert!(!decision.qualifies());
    }

    #[test]
    fn test_fires_now_when_fire_time_passed() {
        let cfg = StrategyConfig::default();
        let now = Utc::now();
        let event = now + Duration::seconds(3);
        assert_eq!(
            decide(&snap(Some(dec!(0.01)), Some(event)), now, &cfg),
            ArmDecision::FireNow { event_time: event }
        );
    }

    #[test]
    fn test_skips_below_threshold_and_past_events() {
        let cfg = StrategyConfig::default();
        let now = Utc::now();
        assert_eq!(
            decide(&snap(Some(dec!(0.0049)), Some(now + Duration::seconds(8))), now, &cfg),
            ArmDecision::Skip(SkipReason::BelowThreshold)
        );
        assert_eq!(
            decide(&snap(Some(dec!(0.01)), Some(now - Duration::seconds(1))), now, &cfg),
            ArmDecision::Skip(SkipReason::EventPassed)
        );
        assert_eq!(
            decide(&snap(Some(dec!(0.01)), None), now, &cfg),
            ArmDecision::Skip(SkipReason::NoEventTime)
        );
        assert_eq!(
            decide(&snap(None, Some(now)), now, &cfg),
            ArmDecision::Skip(SkipReason::NoFundingRate)
        );
    }

    #[test]
    fn test_armed_iff_qualifying_and_within_window() {
        let cfg = StrategyConfig::default();
        let now = Utc::now();
        for rate in [dec!(0.001), dec!(0.005), dec!(-0.005), dec!(0.03)] {
            for secs in [-3i64, 2, 5, 6, 9, 10, 11, 60] {
                let event = now + Duration::seconds(secs);
                let decision = decide(&snap(Some(rate), Some(event)), now, &cfg);
                let fire_at = event - cfg.pre_offset;
                let expect_armed = rate.abs() >= dec!(0.005)
                    && fire_at > now
                    && fire_at - now <= cfg.pre_offset;
                assert_eq!(
                    matches!(decision, ArmDecision::Arm { .. }),
                    expect_armed,
                    "rate {} event +{}s",
                    rate,
                    secs
                );
            }
        }
    }

    #[tokio::test]
    async fn test_plan_replaces_on_changed_event_time() {
        let now = Utc::now();
        let old_event = now + Duration::seconds(8);
        let entry = ScheduledEntry {
            symbol: "XUSDT".to_string(),
            event_time: old_event,
            timer: spawn_at(old_event - Duration::seconds(5), |_| async {}),
        };
        let slot = SymbolSlot::Armed(entry);

        let same = ArmDecision::Arm {
            fire_at: old_event - Duration::seconds(5),
            event_time: old_event,
        };
        assert_eq!(plan(Some(&slot), same), ScheduleAction::Keep);

        let new_event = now + Duration::seconds(9);
        let moved = ArmDecision::Arm {
            fire_at: new_event - Duration::seconds(5),
            event_time: new_event,
        };
        assert_eq!(
            plan(Some(&slot), moved),
            ScheduleAction::Arm {
                fire_at: new_event - Duration::seconds(5),
                event_time: new_event
            }
        );
        assert_eq!(
            plan(Some(&slot), ArmDecision::Skip(SkipReason::BelowThreshold)),
            ScheduleAction::Disarm
        );
    }

    #[test]
    fn test_plan_leaves_busy_slots_alone() {
        let decision = ArmDecision::FireNow {
            event_time: Utc::now(),
        };
        assert_eq!(plan(Some(&SymbolSlot::Opening), decision), ScheduleAction::Keep);
        assert_eq!(
            plan(None, decision),
            ScheduleAction::FireNow {
                event_time: decision_event(decision)
            }
        );
    }

    fn decision_event(decision: ArmDecision) -> DateTime<Utc> {
        match decision {
            ArmDecision::FireNow { event_time } | ArmDecision::Arm { event_time, .. } => event_time,
            _ => unreachable!(),
        }
    }
}
