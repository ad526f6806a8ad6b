//! Message routing onto call-affinity lanes.
//!
//! Thin glue between the framer and the scheduler: a completed message plus
//! its call identity goes onto the identity's lane, where the lane worker
//! invokes the external [`MessageConsumer`]. Redelivery jumps the queue via
//! front insertion.

use std::sync::Arc;

use crate::error::Result;
use crate::framer::FramedMessage;
use crate::scheduler::{CallAffinityScheduler, ScheduledTask};

/// External consumer of completed messages (the transaction/dialog layer).
///
/// Invoked on the lane worker, one call at a time per lane. While handling a
/// message the consumer may schedule timers for the same call identity; those
/// firings enter the same lane and cannot race this delivery.
pub trait MessageConsumer: Send + Sync {
    /// Handle one message for `call_id`.
    fn on_message(&self, call_id: &str, message: FramedMessage) -> Result<()>;
}

/// Dispatches framed messages to a consumer with per-call ordering.
#[derive(Clone)]
pub struct MessageRouter {
    scheduler: CallAffinityScheduler,
    consumer: Arc<dyn MessageConsumer>,
}

impl MessageRouter {
    /// Create a router delivering through `scheduler` to `consumer`.
    pub fn new(scheduler: CallAffinityScheduler, consumer: Arc<dyn MessageConsumer>) -> Self {
        Self {
            scheduler,
            consumer,
        }
    }

    /// Enqueue a message at the back of its call's lane.
    pub fn dispatch(&self, call_id: impl Into<String>, message: FramedMessage) -> Result<()> {
        let call_id = call_id.into();
        let consumer = self.consumer.clone();
        let task_call_id = call_id.clone();
        self.scheduler.enqueue_back(ScheduledTask::new(
            call_id,
            "message",
            move || consumer.on_message(&task_call_id, message),
        ))
    }

    /// Enqueue a message ahead of queued work on its call's lane.
    ///
    /// For priority redelivery of a message that must be retried before
    /// newly arrived traffic.
    pub fn redeliver(&self, call_id: impl Into<String>, message: FramedMessage) -> Result<()> {
        let call_id = call_id.into();
        let consumer = self.consumer.clone();
        let task_call_id = call_id.clone();
        self.scheduler.enqueue_front(ScheduledTask::new(
            call_id,
            "message-redelivery",
            move || consumer.on_message(&task_call_id, message),
        ))
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("lane_count", &self.scheduler.lane_count())
            .finish()
    }
}
