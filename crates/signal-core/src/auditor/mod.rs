//! Idle connection auditing.
//!
//! The [`ConnectionAuditor`] tracks live connections and periodically sweeps
//! them, evicting any that have been inactive beyond the configured idle
//! threshold. Eviction closes the connection through a time-boxed async
//! operation so one unresponsive close cannot stall the sweep; the connection
//! leaves tracking regardless of the close outcome.
//!
//! The tracked-connections map is a concurrent map: the accept path inserts,
//! the activity path updates timestamps, and the sweep removes, all without
//! external locking. The sweep iterates a snapshot of the key set, so
//! concurrent mutation never invalidates it.
//!
//! Sweeps run as a periodic [`TimerManager`] task. A failed sweep is logged
//! and the next scheduled sweep still runs.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::timer::{TimerManager, TimerTask};

/// Pseudo call identity binding the sweep to one lane.
const AUDITOR_TASK_ID: &str = "connection-auditor";

/// Closable connection handle tracked by the auditor.
///
/// The transport layer implements this for its connection type; the auditor
/// only ever calls `close`, bounded by the configured close timeout.
#[async_trait]
pub trait SignalingConnection: Send + Sync {
    /// Stable identifier of the connection (e.g. peer address).
    fn id(&self) -> String;

    /// Close the underlying transport.
    async fn close(&self) -> Result<()>;
}

/// A tracked connection plus its last-activity timestamp.
pub struct ChannelRecord {
    connection: Arc<dyn SignalingConnection>,
    last_activity: Instant,
}

impl ChannelRecord {
    /// Time since the connection last showed activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

struct AuditorInner {
    connections: DashMap<String, ChannelRecord>,
    idle_threshold: Duration,
    close_timeout: Duration,
    max_sweep_iterations: AtomicUsize,
    removed_total: AtomicU64,
    running: AtomicBool,
    sweep_task: Mutex<Option<Arc<TimerTask>>>,
}

/// Periodic sweeper that evicts idle connections.
#[derive(Clone)]
pub struct ConnectionAuditor {
    inner: Arc<AuditorInner>,
}

impl ConnectionAuditor {
    /// Create an auditor from the engine configuration. Sweeping does not
    /// begin until [`ConnectionAuditor::start`].
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(AuditorInner {
                connections: DashMap::new(),
                idle_threshold: config.idle_threshold,
                close_timeout: config.close_timeout,
                max_sweep_iterations: AtomicUsize::new(config.max_sweep_iterations),
                removed_total: AtomicU64::new(0),
                running: AtomicBool::new(false),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    /// Track a connection, marking it active now. Re-tracking an id refreshes
    /// its record.
    pub fn track(&self, connection: Arc<dyn SignalingConnection>) {
        let id = connection.id();
        trace!(connection_id = %id, "tracking connection");
        self.inner.connections.insert(
            id,
            ChannelRecord {
                connection,
                last_activity: Instant::now(),
            },
        );
    }

    /// Record activity on a tracked connection.
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut record) = self.inner.connections.get_mut(connection_id) {
            record.last_activity = Instant::now();
        }
    }

    /// Stop tracking a connection without closing it (e.g. the transport
    /// already closed it).
    pub fn untrack(&self, connection_id: &str) {
        self.inner.connections.remove(connection_id);
    }

    /// Number of currently tracked connections.
    pub fn tracked_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Total connections removed by sweeps since creation.
    pub fn removed_count(&self) -> u64 {
        self.inner.removed_total.load(Ordering::Relaxed)
    }

    /// Current per-sweep iteration cap.
    pub fn max_sweep_iterations(&self) -> usize {
        self.inner.max_sweep_iterations.load(Ordering::Relaxed)
    }

    /// Set the per-sweep iteration cap.
    pub fn set_max_sweep_iterations(&self, max: usize) {
        self.inner.max_sweep_iterations.store(max, Ordering::Relaxed);
    }

    /// True while sweeps are enabled.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Begin periodic sweeping on `timers` with the given cadence.
    ///
    /// Calling `start` again after [`ConnectionAuditor::pause`] resumes
    /// sweeping without scheduling a second timer.
    pub fn start(&self, timers: &TimerManager, sweep_interval: Duration) -> Result<()> {
        self.inner.running.store(true, Ordering::Release);

        let mut slot = self
            .inner
            .sweep_task
            .lock()
            .expect("auditor sweep task lock poisoned");
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("auditor sweep timer already scheduled, resuming");
            return Ok(());
        }

        // The timer body holds a weak handle: the auditor owns the timer
        // task, so a strong capture would form a reference cycle.
        let weak = Arc::downgrade(&self.inner);
        let task = timers.schedule_with_period(
            AUDITOR_TASK_ID,
            sweep_interval,
            sweep_interval,
            move || {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let auditor = ConnectionAuditor { inner };
                if !auditor.is_running() {
                    return Ok(());
                }
                // A failed sweep must not cancel future sweeps: log and
                // report success to the timer.
                if let Err(e) = auditor.sweep() {
                    warn!(error = %e, "idle sweep failed");
                }
                Ok(())
            },
        )?;
        *slot = Some(task);
        info!(interval_ms = sweep_interval.as_millis() as u64, "connection auditor started");
        Ok(())
    }

    /// Pause sweeping. Tracked connections are kept; the periodic timer keeps
    /// firing but does nothing until `start` is called again.
    pub fn pause(&self) {
        self.inner.running.store(false, Ordering::Release);
        debug!("connection auditor paused");
    }

    /// Run one sweep now: evict every tracked connection idle beyond the
    /// threshold, up to the iteration cap.
    ///
    /// Iterates a snapshot of the key set, so insertions and removals by
    /// other threads during the sweep are harmless.
    pub fn sweep(&self) -> Result<()> {
        let now = Instant::now();
        let max_iterations = self.max_sweep_iterations();
        let ids: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .take(max_iterations)
            .collect();

        let mut removed = 0u64;
        for id in ids {
            // The record may have been untracked since the snapshot.
            let Some(idle) = self
                .inner
                .connections
                .get(&id)
                .map(|record| record.idle_for(now))
            else {
                continue;
            };
            if idle <= self.inner.idle_threshold {
                continue;
            }

            let Some((_, record)) = self.inner.connections.remove(&id) else {
                continue;
            };
            removed += 1;
            debug!(
                connection_id = %id,
                idle_ms = idle.as_millis() as u64,
                "evicting idle connection"
            );
            self.spawn_bounded_close(id, record.connection);
        }

        if removed > 0 {
            self.inner.removed_total.fetch_add(removed, Ordering::Relaxed);
            info!(removed, tracked = self.tracked_count(), "idle sweep complete");
        }
        Ok(())
    }

    /// Close a connection with a hard wait ceiling. Timing out still counts
    /// as a completed removal attempt.
    fn spawn_bounded_close(&self, id: String, connection: Arc<dyn SignalingConnection>) {
        let close_timeout = self.inner.close_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(close_timeout, connection.close()).await {
                Ok(Ok(())) => trace!(connection_id = %id, "idle connection closed"),
                Ok(Err(e)) => {
                    warn!(connection_id = %id, error = %e, "idle connection close failed")
                }
                Err(_) => {
                    warn!(
                        connection_id = %id,
                        timeout_ms = close_timeout.as_millis() as u64,
                        "idle connection close timed out"
                    );
                }
            }
        });
    }
}

impl std::fmt::Debug for ConnectionAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAuditor")
            .field("tracked", &self.tracked_count())
            .field("removed_total", &self.removed_count())
            .field("running", &self.is_running())
            .finish()
    }
}
