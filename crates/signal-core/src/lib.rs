//! Ingestion and dispatch core for the sigstream signaling engine.
//!
//! This crate turns a raw, arbitrarily-chunked byte stream from a transport
//! connection into discrete protocol messages, routes each message and every
//! related timer event to one of a fixed set of processing lanes chosen
//! deterministically by call identity, and drives retransmission/idle-timeout
//! timers on those same lanes. A call's messages and its timers are therefore
//! never reordered relative to each other, while distinct calls run in
//! parallel.
//!
//! ```text
//! socket bytes ─▶ StreamFramer ─▶ FramedMessage ─▶ MessageRouter
//!                                                       │ hash(call_id)
//!                                                       ▼
//!                                     lane queue ─▶ lane worker ─▶ consumer
//!                                                       ▲
//!                  TimerManager ── firings for call ────┘
//! ```
//!
//! Header grammar, transaction/dialog state machines, and TLS policy live in
//! collaborating crates; this core frames, orders, times, and audits.

pub mod auditor;
pub mod config;
pub mod error;
pub mod framer;
pub mod router;
pub mod scheduler;
pub mod timer;

pub use auditor::{ChannelRecord, ConnectionAuditor, SignalingConnection};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use framer::{FramedMessage, FramerOutput, MessageFactory, RawMessageFactory, StreamFramer};
pub use router::{MessageConsumer, MessageRouter};
pub use scheduler::{CallAffinityScheduler, ScheduledTask};
pub use timer::{TimerManager, TimerTask};

/// Re-export of common types for easier use.
pub mod prelude {
    pub use crate::{
        CallAffinityScheduler, ConnectionAuditor, EngineConfig, Error, FramedMessage,
        FramerOutput, MessageConsumer, MessageFactory, MessageRouter, Result, ScheduledTask,
        SignalingConnection, StreamFramer, TimerManager, TimerTask,
    };
}
