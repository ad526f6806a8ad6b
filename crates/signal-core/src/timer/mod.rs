//! Timer subsystem.
//!
//! Retransmission and timeout timers for the signaling engine. Every timer is
//! bound to a call identity, and its firings are routed through the
//! call-affinity scheduler onto that identity's lane, so a call's timer
//! callbacks never race with that call's message processing.
//!
//! ```text
//! ┌──────────────┐  schedule   ┌───────────┐  due   ┌──────────────────────┐
//! │ TimerManager │────────────▶│ TimerTask │───────▶│ lane of hash(call_id)│
//! └──────────────┘             └───────────┘        └──────────────────────┘
//! ```
//!
//! Key components:
//! - [`TimerTask`]: one scheduled timer with its due timestamp, period, and
//!   cancellation flag.
//! - [`TimerManager`]: schedules one-shot and periodic timers, drives their
//!   firing, and purges finished bookkeeping on a configured cadence.

pub mod manager;
pub mod types;

pub use manager::TimerManager;
pub use types::{TimerTask, NEVER};
