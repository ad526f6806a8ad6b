//! Call-affinity scheduling.
//!
//! The [`CallAffinityScheduler`] owns a fixed array of lanes, each an ordered
//! task queue drained by exactly one worker task. A call identity maps to a
//! lane through a pure, stable hash, so every message and timer firing that
//! belongs to one call executes on the same lane and therefore in a strict
//! total order. Different calls run fully in parallel across lanes.
//!
//! ```text
//!  enqueue_back(task)  ──hash(call_id) % lanes──▶  lane queue ──▶ worker
//!  enqueue_front(task) ──────────────────────────▶ (priority redelivery)
//! ```
//!
//! Workers run each task to completion with no suspension point inside the
//! task body. After [`CallAffinityScheduler::stop`], enqueues are rejected
//! with [`Error::SchedulerStopped`] so callers can detect shutdown races;
//! already-queued work is drained before the workers exit.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

/// How long `stop()` waits for workers to drain before aborting them.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A unit of work bound to a call identity.
///
/// The body runs to completion on the lane worker; an `Err` return is logged
/// with the lane and call identity and never kills the worker.
pub struct ScheduledTask {
    call_id: String,
    label: &'static str,
    body: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
}

impl ScheduledTask {
    /// Create a task for `call_id`. `label` names the task kind in logs.
    pub fn new<F>(call_id: impl Into<String>, label: &'static str, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            call_id: call_id.into(),
            label,
            body: Box::new(body),
        }
    }

    /// The call identity that drives lane affinity.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("call_id", &self.call_id)
            .field("label", &self.label)
            .finish()
    }
}

/// One lane: an ordered queue plus the wakeup for its single consumer.
///
/// The closed flag lives under the same mutex as the queue, so a push and the
/// shutdown decision are atomic: once `close()` has run, no push can land, and
/// every push that succeeded is visible to the draining worker.
struct LaneQueue {
    state: Mutex<LaneState>,
    notify: Notify,
}

struct LaneState {
    tasks: VecDeque<ScheduledTask>,
    closed: bool,
}

impl LaneQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, task: ScheduledTask) -> Result<()> {
        {
            let mut state = self.state.lock().expect("lane queue lock poisoned");
            if state.closed {
                return Err(Error::SchedulerStopped);
            }
            state.tasks.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn push_front(&self, task: ScheduledTask) -> Result<()> {
        {
            let mut state = self.state.lock().expect("lane queue lock poisoned");
            if state.closed {
                return Err(Error::SchedulerStopped);
            }
            state.tasks.push_front(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<ScheduledTask> {
        self.state
            .lock()
            .expect("lane queue lock poisoned")
            .tasks
            .pop_front()
    }

    fn close(&self) {
        self.state.lock().expect("lane queue lock poisoned").closed = true;
    }

    fn len(&self) -> usize {
        self.state
            .lock()
            .expect("lane queue lock poisoned")
            .tasks
            .len()
    }
}

struct SchedulerInner {
    lanes: Vec<Arc<LaneQueue>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-size array of single-consumer lanes keyed by call identity.
#[derive(Clone)]
pub struct CallAffinityScheduler {
    inner: Arc<SchedulerInner>,
}

impl CallAffinityScheduler {
    /// Start a scheduler with `lane_count` lanes, one worker per lane.
    pub fn start(lane_count: usize) -> Result<Self> {
        if lane_count == 0 {
            return Err(Error::InvalidConfig("lane_count must be > 0".into()));
        }

        let lanes: Vec<Arc<LaneQueue>> = (0..lane_count).map(|_| Arc::new(LaneQueue::new())).collect();
        let inner = Arc::new(SchedulerInner {
            lanes,
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::with_capacity(lane_count)),
        });

        let mut handles = Vec::with_capacity(lane_count);
        for (lane_index, queue) in inner.lanes.iter().enumerate() {
            let queue = queue.clone();
            let cancel = inner.cancel.clone();
            handles.push(tokio::spawn(run_lane_worker(lane_index, queue, cancel)));
        }
        *inner.workers.lock().expect("scheduler worker lock poisoned") = handles;

        debug!(lane_count, "call-affinity scheduler started");
        Ok(Self { inner })
    }

    /// Number of lanes, fixed at start.
    pub fn lane_count(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Deterministic lane index for a call identity.
    ///
    /// Pure and stable for the process lifetime: the same identity always
    /// lands on the same lane given the fixed lane count.
    pub fn index_for(&self, call_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        call_id.hash(&mut hasher);
        (hasher.finish() % self.inner.lanes.len() as u64) as usize
    }

    /// Queued task count on one lane, for observability.
    pub fn queue_depth(&self, lane_index: usize) -> usize {
        self.inner.lanes[lane_index].len()
    }

    /// True once `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Enqueue a task at the back of its call's lane.
    ///
    /// Rejection is decided under the lane lock, so an enqueue racing `stop()`
    /// either lands before the lane closes (and is drained) or gets
    /// [`Error::SchedulerStopped`]; it can never strand the task.
    pub fn enqueue_back(&self, task: ScheduledTask) -> Result<()> {
        let lane = self.index_for(task.call_id());
        trace!(lane, call_id = %task.call_id(), label = task.label, "enqueue back");
        self.inner.lanes[lane].push_back(task)
    }

    /// Enqueue a task at the front of its call's lane.
    ///
    /// Used for work that must be retried ahead of newly arrived tasks.
    /// Same shutdown contract as [`enqueue_back`](Self::enqueue_back).
    pub fn enqueue_front(&self, task: ScheduledTask) -> Result<()> {
        let lane = self.index_for(task.call_id());
        trace!(lane, call_id = %task.call_id(), label = task.label, "enqueue front");
        self.inner.lanes[lane].push_front(task)
    }

    /// Stop accepting work, drain the lanes, and terminate the workers.
    ///
    /// Workers finish everything already queued. If draining takes longer
    /// than the stop timeout the remaining workers are aborted.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stopping call-affinity scheduler");
        // Close every lane before waking the workers: tasks pushed up to this
        // point are in their queues and get drained; nothing lands after.
        for lane in &self.inner.lanes {
            lane.close();
        }
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .expect("scheduler worker lock poisoned"),
        );
        for mut handle in handles {
            if tokio::time::timeout(STOP_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("lane worker did not drain in time during stop, aborting");
                handle.abort();
            }
        }
        debug!("call-affinity scheduler stopped");
    }
}

impl std::fmt::Debug for CallAffinityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallAffinityScheduler")
            .field("lane_count", &self.inner.lanes.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Single consumer loop for one lane.
///
/// Tasks run strictly in queue order, one at a time. On cancellation the
/// worker drains whatever is still queued, then exits.
async fn run_lane_worker(lane_index: usize, queue: Arc<LaneQueue>, cancel: CancellationToken) {
    trace!(lane = lane_index, "lane worker started");
    loop {
        match queue.pop() {
            Some(task) => {
                let call_id = task.call_id;
                let label = task.label;
                if let Err(e) = (task.body)() {
                    // Task failures are logged, never fatal to the lane.
                    error!(lane = lane_index, call_id = %call_id, label, error = %e, "lane task failed");
                }
            }
            None => {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
    trace!(lane = lane_index, "lane worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn lane_index_is_deterministic() {
        let scheduler = CallAffinityScheduler::start(8).unwrap();
        for call_id in ["a@host", "b@host", "7f000001-1234"] {
            let first = scheduler.index_for(call_id);
            for _ in 0..100 {
                assert_eq!(scheduler.index_for(call_id), first);
            }
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn lanes_are_reasonably_balanced() {
        let scheduler = CallAffinityScheduler::start(8).unwrap();
        let mut occupancy = vec![0usize; 8];
        let samples = 8000;
        for i in 0..samples {
            let call_id = format!("call-{}@10.0.{}.{}", i, i % 251, (i * 7) % 251);
            occupancy[scheduler.index_for(&call_id)] += 1;
        }
        let mean = samples / 8;
        for (lane, count) in occupancy.iter().enumerate() {
            assert!(
                *count > mean / 2 && *count < mean * 2,
                "lane {} occupancy {} too far from mean {}",
                lane,
                count,
                mean
            );
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn same_call_tasks_execute_in_order() {
        let scheduler = CallAffinityScheduler::start(4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let total = 200;

        // Two producer tasks interleave enqueues for the same call identity.
        let mut producers = Vec::new();
        for half in 0..2u32 {
            let scheduler = scheduler.clone();
            let log = log.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..(total / 2) {
                    let seq = half * (total / 2) + i;
                    let log = log.clone();
                    scheduler
                        .enqueue_back(ScheduledTask::new("call-ordered", "test", move || {
                            log.lock().unwrap().push(seq);
                            Ok(())
                        }))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }

        wait_for(|| log.lock().unwrap().len() == total as usize).await;
        // Each producer's own sequence must appear in order.
        let executed = log.lock().unwrap().clone();
        for half in 0..2u32 {
            let seen: Vec<u32> = executed
                .iter()
                .copied()
                .filter(|s| s / (total / 2) == half)
                .collect();
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            assert_eq!(seen, sorted, "producer {} reordered", half);
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn front_insertion_runs_before_queued_work() {
        let scheduler = CallAffinityScheduler::start(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (label, seq) in [("back", 1), ("back", 2)] {
            let log = log.clone();
            scheduler
                .enqueue_back(ScheduledTask::new("call-x", label, move || {
                    log.lock().unwrap().push(seq);
                    Ok(())
                }))
                .unwrap();
        }
        // All three enqueues happen before the current-thread worker gets to
        // run, so the front insertion must be observed first.
        let log_front = log.clone();
        scheduler
            .enqueue_front(ScheduledTask::new("call-x", "front", move || {
                log_front.lock().unwrap().push(0);
                Ok(())
            }))
            .unwrap();

        wait_for(|| log.lock().unwrap().len() == 3).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn task_failure_does_not_kill_lane() {
        let scheduler = CallAffinityScheduler::start(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        scheduler
            .enqueue_back(ScheduledTask::new("call-f", "fails", || {
                Err(Error::Task("boom".into()))
            }))
            .unwrap();
        let ran_clone = ran.clone();
        scheduler
            .enqueue_back(ScheduledTask::new("call-f", "runs", move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        wait_for(|| ran.load(Ordering::SeqCst) == 1).await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_rejected() {
        let scheduler = CallAffinityScheduler::start(2).unwrap();
        scheduler.stop().await;
        let result = scheduler.enqueue_back(ScheduledTask::new("late", "test", || Ok(())));
        assert!(matches!(result, Err(Error::SchedulerStopped)));
        let result = scheduler.enqueue_front(ScheduledTask::new("late", "test", || Ok(())));
        assert!(matches!(result, Err(Error::SchedulerStopped)));
    }

    #[tokio::test]
    async fn enqueue_racing_stop_cannot_strand_a_task() {
        let scheduler = CallAffinityScheduler::start(1).unwrap();
        let lane = scheduler.inner.lanes[0].clone();
        scheduler.stop().await;
        // An enqueue may have read the stopped flag as false before stop()
        // completed; the push itself must still be rejected under the lane
        // lock rather than left in a queue no worker will ever drain.
        let result = lane.push_back(ScheduledTask::new("late", "test", || Ok(())));
        assert!(matches!(result, Err(Error::SchedulerStopped)));
        let result = lane.push_front(ScheduledTask::new("late", "test", || Ok(())));
        assert!(matches!(result, Err(Error::SchedulerStopped)));
        assert_eq!(lane.len(), 0);
    }

    #[tokio::test]
    async fn stop_drains_queued_work() {
        let scheduler = CallAffinityScheduler::start(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..50 {
            let ran = ran.clone();
            scheduler
                .enqueue_back(ScheduledTask::new(format!("call-{}", i), "test", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        scheduler.stop().await;
        assert_eq!(ran.load(Ordering::SeqCst), 50);
    }
}
