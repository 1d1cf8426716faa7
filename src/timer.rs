//! Cancellable one-shot timers.
//!
//! A timer is a spawned task that sleeps until its deadline and then runs its
//! action. The handle carries a process-unique id so the fired action can check
//! that it is still the timer the symbol's slot refers to.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    deadline: DateTime<Utc>,
    task: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Abort the timer. Safe to call on a timer that already fired or was cancelled.
    ///
    /// Once the action has taken over its slot the handle is no longer reachable
    /// from the slot table, so a fired action is never aborted midway.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Time left until `deadline`, zero if it has passed.
pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Spawn `action(id)` to run at `deadline` (immediately if it already passed).
pub fn spawn_at<F, Fut>(deadline: DateTime<Utc>, action: F) -> TimerHandle
where
    F: FnOnce(u64) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
    let wait = until(deadline, Utc::now());
    let task = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        action(id).await;
    })
    .abort_handle();
    TimerHandle { id, deadline, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _handle = spawn_at(Utc::now() + chrono::Duration::seconds(3), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_prevents_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = spawn_at(Utc::now() + chrono::Duration::seconds(1), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_until_clamps_past_deadlines() {
        let now = Utc::now();
        assert_eq!(until(now - chrono::Duration::seconds(10), now), Duration::ZERO);
        assert_eq!(until(now + chrono::Duration::seconds(2), now), Duration::from_secs(2));
    }
}
