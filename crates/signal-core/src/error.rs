//! Error types for the signaling core.
//!
//! A single crate-wide [`Error`] enum and [`Result`] alias are used across the
//! framer, scheduler, timer, and auditor components. Fatal conditions (message
//! size budget exceeded, post-shutdown scheduling) are distinct variants so the
//! transport layer can tell them apart from per-message failures it is allowed
//! to swallow.

use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the signaling core.
#[derive(Debug, Error)]
pub enum Error {
    /// The current message grew past the configured per-message byte budget.
    ///
    /// Fatal for the connection: the transport layer must close it. The framer
    /// cannot resynchronize once a message overruns its declared framing.
    #[error("message exceeds maximum size: {size} > {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// The body-length header carried a value that does not parse as a length.
    #[error("invalid body-length header value: {0:?}")]
    InvalidContentLength(String),

    /// The message factory rejected a completed header block + body.
    ///
    /// Non-fatal: the framer logs it, drops the message, and resets for the
    /// next one on the same connection.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Configuration failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Work was submitted to the scheduler after `stop()`.
    #[error("scheduler is stopped")]
    SchedulerStopped,

    /// A timer was scheduled after the timer subsystem shut down.
    #[error("timer subsystem is stopped")]
    TimerStopped,

    /// A tracked connection failed to close.
    #[error("connection close failed: {0}")]
    ConnectionClose(String),

    /// A bounded close attempt ran past its wait ceiling.
    #[error("connection close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// A task body reported a failure; logged by the lane worker.
    #[error("task failed: {0}")]
    Task(String),
}
