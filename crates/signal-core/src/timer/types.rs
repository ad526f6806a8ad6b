//! Timer task type and its terminal-state sentinel.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;

/// Due-timestamp sentinel meaning "never fires again".
///
/// A one-shot timer reaches it after its single firing; cancellation stores it
/// as well. A task whose due timestamp is `NEVER` is skipped at execution time
/// even if a firing was already in flight when the sentinel was written.
pub const NEVER: u64 = u64::MAX;

/// The user callback run on each firing.
pub type TimerBody = Arc<dyn Fn() -> Result<()> + Send + Sync + 'static>;

/// One scheduled timer, bound to a call identity.
///
/// Due timestamps are milliseconds relative to the owning manager's epoch.
/// All mutable state is atomic so cancellation from any thread is safe while
/// a firing is concurrently in flight.
pub struct TimerTask {
    id: u64,
    call_id: String,
    created_at: Instant,
    due_ms: AtomicU64,
    /// Period in milliseconds; zero or negative means one-shot/disabled.
    period_ms: AtomicI64,
    cancelled: AtomicBool,
    body: TimerBody,
}

impl TimerTask {
    pub(crate) fn new(
        id: u64,
        call_id: String,
        due_ms: u64,
        period_ms: i64,
        body: TimerBody,
    ) -> Self {
        Self {
            id,
            call_id,
            created_at: Instant::now(),
            due_ms: AtomicU64::new(due_ms),
            period_ms: AtomicI64::new(period_ms),
            cancelled: AtomicBool::new(false),
            body,
        }
    }

    /// Unique id within the owning manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The call identity whose lane executes this timer's firings.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// When the task was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Next due timestamp in manager-epoch milliseconds, or [`NEVER`].
    pub fn due_ms(&self) -> u64 {
        self.due_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_due_ms(&self, due_ms: u64) {
        self.due_ms.store(due_ms, Ordering::Release);
    }

    /// Period in milliseconds; `<= 0` means one-shot or disabled.
    pub fn period_ms(&self) -> i64 {
        self.period_ms.load(Ordering::Acquire)
    }

    /// True for a timer that re-registers after each firing.
    pub fn is_periodic(&self) -> bool {
        self.period_ms() > 0
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the task can never fire again.
    ///
    /// Checks the cancelled flag as well as the sentinel: a periodic
    /// reschedule racing a cancel may briefly leave a real due timestamp
    /// behind, and a cancelled task must stay finished regardless.
    pub fn is_finished(&self) -> bool {
        self.is_cancelled() || self.due_ms() == NEVER
    }

    /// Cancel the task. Idempotent; safe while a firing is in flight because
    /// the execution path re-reads the sentinel before running the body.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.period_ms.store(-1, Ordering::Release);
        self.due_ms.store(NEVER, Ordering::Release);
    }

    pub(crate) fn run_body(&self) -> Result<()> {
        (self.body)()
    }
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.id)
            .field("call_id", &self.call_id)
            .field("due_ms", &self.due_ms())
            .field("period_ms", &self.period_ms())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(due_ms: u64, period_ms: i64) -> TimerTask {
        TimerTask::new(1, "call-a".into(), due_ms, period_ms, Arc::new(|| Ok(())))
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let task = noop_task(100, 50);
        assert!(task.is_periodic());
        assert!(!task.is_finished());
        task.cancel();
        assert!(task.is_cancelled());
        assert!(task.is_finished());
        assert!(!task.is_periodic());
        task.cancel();
        assert_eq!(task.due_ms(), NEVER);
    }

    #[test]
    fn cancel_outlives_a_racing_reschedule() {
        let task = noop_task(100, 50);
        task.cancel();
        // A periodic reschedule writing a fresh due timestamp after the
        // cancel must not bring the task back to life.
        task.set_due_ms(150);
        assert!(task.is_finished());
    }

    #[test]
    fn one_shot_has_no_period() {
        let task = noop_task(10, -1);
        assert!(!task.is_periodic());
        assert_eq!(task.period_ms(), -1);
    }
}
