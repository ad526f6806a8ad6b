//! Timer scheduling and execution.
//!
//! [`TimerManager`] owns the clock epoch, the bookkeeping registry, and the
//! firing protocol. A firing never runs inline in the timer's sleep task:
//! it is enqueued onto the call's scheduler lane, where it executes in FIFO
//! order with that call's messages.
//!
//! Firing protocol per task:
//! 1. Skip if the due timestamp reached the [`NEVER`] sentinel (cancelled or
//!    already finished). The check runs again at execution time on the lane,
//!    so a cancel racing with a firing still wins.
//! 2. Run the body; a failure is logged by the lane worker, never fatal.
//! 3. Periodic tasks re-register at `previous_due + period`; one-shots store
//!    the sentinel so they can never refire even if retained.
//!
//! Finished entries stay in the registry until the periodic purge removes
//! them (cadence from `EngineConfig::purge_interval`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::scheduler::{CallAffinityScheduler, ScheduledTask};
use crate::timer::types::{TimerBody, TimerTask, NEVER};

struct TimerManagerInner {
    scheduler: CallAffinityScheduler,
    epoch: Instant,
    next_id: AtomicU64,
    tasks: DashMap<u64, Arc<TimerTask>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

/// Schedules one-shot and periodic timers keyed by call identity.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerManagerInner>,
}

impl TimerManager {
    /// Create a manager firing through `scheduler`, purging finished
    /// bookkeeping every `purge_interval`.
    pub fn new(scheduler: CallAffinityScheduler, purge_interval: Duration) -> Self {
        let inner = Arc::new(TimerManagerInner {
            scheduler,
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
            tasks: DashMap::new(),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        if !purge_interval.is_zero() {
            let purge_inner = inner.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(purge_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // First tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let removed = purge_finished_entries(&purge_inner.tasks);
                            if removed > 0 {
                                trace!(removed, "purged finished timer entries");
                            }
                        }
                        _ = purge_inner.cancel.cancelled() => break,
                    }
                }
            });
        }

        Self { inner }
    }

    /// Milliseconds since the manager epoch.
    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    /// Schedule a one-shot timer for `call_id`, firing after `delay`.
    pub fn schedule_once<F>(
        &self,
        call_id: impl Into<String>,
        delay: Duration,
        body: F,
    ) -> Result<Arc<TimerTask>>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.schedule(call_id.into(), delay, -1, Arc::new(body))
    }

    /// Schedule a periodic timer for `call_id`: first firing after `delay`,
    /// then every `period`.
    pub fn schedule_with_period<F>(
        &self,
        call_id: impl Into<String>,
        delay: Duration,
        period: Duration,
        body: F,
    ) -> Result<Arc<TimerTask>>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let period_ms = period.as_millis() as i64;
        if period_ms <= 0 {
            return Err(Error::InvalidConfig("timer period must be > 0".into()));
        }
        self.schedule(call_id.into(), delay, period_ms, Arc::new(body))
    }

    fn schedule(
        &self,
        call_id: String,
        delay: Duration,
        period_ms: i64,
        body: TimerBody,
    ) -> Result<Arc<TimerTask>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(Error::TimerStopped);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let due_ms = self.now_ms().saturating_add(delay.as_millis() as u64);
        let task = Arc::new(TimerTask::new(id, call_id, due_ms, period_ms, body));
        self.inner.tasks.insert(id, task.clone());
        trace!(
            task_id = id,
            call_id = %task.call_id(),
            due_ms,
            period_ms,
            "timer scheduled"
        );
        spawn_fire(self.inner.clone(), task.clone());
        Ok(task)
    }

    /// Cancel a timer. Idempotent; a firing already pulled for execution is
    /// still suppressed by the execution-time sentinel check.
    pub fn cancel(&self, task: &TimerTask) {
        task.cancel();
        trace!(task_id = task.id(), call_id = %task.call_id(), "timer cancelled");
    }

    /// Number of timers that can still fire.
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Drop finished bookkeeping entries now; returns how many were removed.
    /// The periodic purge calls this on the configured cadence.
    pub fn purge_finished(&self) -> usize {
        purge_finished_entries(&self.inner.tasks)
    }

    /// Stop the subsystem: cancel every registered timer and the purge loop.
    /// Later schedule calls return [`Error::TimerStopped`].
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stopping timer subsystem");
        self.inner.cancel.cancel();
        for entry in self.inner.tasks.iter() {
            entry.value().cancel();
        }
        self.inner.tasks.clear();
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("registered", &self.inner.tasks.len())
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish()
    }
}

fn purge_finished_entries(tasks: &DashMap<u64, Arc<TimerTask>>) -> usize {
    let before = tasks.len();
    tasks.retain(|_, task| !task.is_finished());
    before - tasks.len()
}

/// Sleep until the task's due timestamp, then hand the firing to its lane.
fn spawn_fire(inner: Arc<TimerManagerInner>, task: Arc<TimerTask>) {
    tokio::spawn(async move {
        let due_ms = task.due_ms();
        if due_ms == NEVER {
            return;
        }
        let deadline = inner.epoch + Duration::from_millis(due_ms);
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            _ = inner.cancel.cancelled() => return,
        }
        enqueue_fire(&inner, task);
    });
}

/// Route one firing onto the call's lane.
fn enqueue_fire(inner: &Arc<TimerManagerInner>, task: Arc<TimerTask>) {
    if task.is_cancelled() || task.due_ms() == NEVER {
        return;
    }

    let lane_task = {
        let inner = inner.clone();
        let task = task.clone();
        ScheduledTask::new(task.call_id().to_string(), "timer-fire", move || {
            // Re-read the sentinel at execution time: a cancel that raced the
            // sleep or the queue wait must still suppress this firing.
            if task.is_cancelled() || task.due_ms() == NEVER {
                return Ok(());
            }

            let result = task.run_body();

            let period = task.period_ms();
            if period > 0 && !task.is_cancelled() {
                let next_due = task.due_ms().saturating_add(period as u64);
                task.set_due_ms(next_due);
                // A cancel can land between the check above and the store;
                // its sentinel must win so the entry stays purgeable.
                if task.is_cancelled() {
                    task.set_due_ms(NEVER);
                } else {
                    spawn_fire(inner.clone(), task.clone());
                }
            } else {
                task.set_due_ms(NEVER);
            }

            // An Err here is logged by the lane worker with lane/call fields;
            // it never terminates the lane or the subsystem.
            result
        })
    };

    if let Err(e) = inner.scheduler.enqueue_back(lane_task) {
        debug!(task_id = task.id(), error = %e, "timer firing dropped during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn engine(lanes: usize) -> (CallAffinityScheduler, TimerManager) {
        let scheduler = CallAffinityScheduler::start(lanes).unwrap();
        let timers = TimerManager::new(scheduler.clone(), Duration::from_secs(60));
        (scheduler, timers)
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_exactly_once() {
        let (scheduler, timers) = engine(2);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();

        let task = timers
            .schedule_once("call-a", Duration::from_millis(20), move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
        assert_eq!(task.due_ms(), NEVER);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_fires_on_cadence() {
        let (scheduler, timers) = engine(2);
        let fire_times = Arc::new(Mutex::new(Vec::new()));
        let fire_times_clone = fire_times.clone();
        let start = tokio::time::Instant::now();

        timers
            .schedule_with_period(
                "call-p",
                Duration::from_millis(20),
                Duration::from_millis(30),
                move || {
                    fire_times_clone
                        .lock()
                        .unwrap()
                        .push(tokio::time::Instant::now());
                    Ok(())
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let times = fire_times.lock().unwrap().clone();
        assert!(times.len() >= 3, "expected >= 3 fires, got {}", times.len());

        // Approximately T0+20, T0+50, T0+80 under paused time.
        let expected = [20u64, 50, 80];
        for (i, expected_ms) in expected.iter().enumerate() {
            let offset = times[i].duration_since(start).as_millis() as u64;
            assert!(
                offset.abs_diff(*expected_ms) <= 5,
                "fire {} at +{}ms, expected ~{}ms",
                i,
                offset,
                expected_ms
            );
        }
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_periodic_timer() {
        let (scheduler, timers) = engine(2);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();

        let task = timers
            .schedule_with_period(
                "call-c",
                Duration::from_millis(10),
                Duration::from_millis(10),
                move || {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 1);
        timers.cancel(&task);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // A firing already in flight at cancel time may land once; nothing
        // beyond that.
        let after = fired.load(Ordering::SeqCst);
        assert!(after <= seen + 1, "fired {} times after cancel", after - seen);
        let final_count = after;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), final_count);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_first_fire_suppresses_it() {
        let (scheduler, timers) = engine(2);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();

        let task = timers
            .schedule_once("call-n", Duration::from_millis(50), move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        timers.cancel(&task);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_periodic_timer_stays_purgeable() {
        let (scheduler, timers) = engine(2);
        let task = timers
            .schedule_with_period(
                "call-r",
                Duration::from_millis(10),
                Duration::from_millis(10),
                || Ok(()),
            )
            .unwrap();

        // Let at least one firing (and its reschedule) happen, then cancel.
        tokio::time::sleep(Duration::from_millis(15)).await;
        timers.cancel(&task);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(task.is_finished());
        assert_eq!(timers.active_count(), 0);
        assert_eq!(timers.purge_finished(), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn body_failure_does_not_stop_periodic_timer() {
        let (scheduler, timers) = engine(2);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();

        timers
            .schedule_with_period(
                "call-e",
                Duration::from_millis(10),
                Duration::from_millis(10),
                move || {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Task("always fails".into()))
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(fired.load(Ordering::SeqCst) >= 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_finished_entries() {
        let (scheduler, timers) = engine(2);
        let task = timers
            .schedule_once("call-g", Duration::from_millis(5), || Ok(()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(task.is_finished());
        assert_eq!(timers.active_count(), 0);
        assert_eq!(timers.purge_finished(), 1);
        assert_eq!(timers.purge_finished(), 0);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_after_stop_is_rejected() {
        let (scheduler, timers) = engine(2);
        timers.stop();
        let result = timers.schedule_once("late", Duration::from_millis(1), || Ok(()));
        assert!(matches!(result, Err(Error::TimerStopped)));
        scheduler.stop().await;
    }
}
