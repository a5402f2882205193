//! # Wire Messages and Typed Channels
//!
//! Message shapes for the dispatcher mailbox and the waiter reply
//! protocol, plus strongly-typed channel wrappers so a command sender can
//! never be confused with a reply sender at a call site.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::batch::Batch;
use crate::error::DownReason;

/// Reply messages delivered to waiters.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The whole batch output plus this waiter's slice coordinates.
    /// Output is shared, so fanning out to many waiters copies nothing.
    Slice {
        start: usize,
        size: usize,
        output: Arc<Vec<Value>>,
        metadata: Value,
    },
    /// A named hook event emitted mid-execution (hooks mode only).
    Hook {
        name: String,
        start: usize,
        size: usize,
        output: Arc<Vec<Value>>,
    },
    /// Sent by the streaming-input producer helper once it knows the final
    /// item total, so the receive loop knows when to stop.
    ProducerFinished { total: usize },
    /// The exchange is over: `Normal` for an orderly streaming end,
    /// anything else for failure.
    Down { reason: DownReason },
}

pub type ReplySender = mpsc::UnboundedSender<Reply>;
pub type ReplyReceiver = mpsc::UnboundedReceiver<Reply>;
pub type AckSender = mpsc::UnboundedSender<usize>;
pub type AckReceiver = mpsc::UnboundedReceiver<usize>;

/// The aliased reference a waiter holds while its batch is in flight.
///
/// Streaming-input producers carry an additional ack sender that workers
/// use to acknowledge per-batch progress.
#[derive(Clone)]
pub struct WaiterRef {
    pub id: Uuid,
    reply: ReplySender,
    ack: Option<AckSender>,
}

impl WaiterRef {
    pub fn new(reply: ReplySender) -> Self {
        Self {
            id: Uuid::new_v4(),
            reply,
            ack: None,
        }
    }

    pub fn with_ack(reply: ReplySender, ack: AckSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            reply,
            ack: Some(ack),
        }
    }

    /// Send a reply. A dropped receiver means the waiter went away; its
    /// messages are discarded, mirroring sends to a dead mailbox.
    pub fn send(&self, reply: Reply) {
        let _ = self.reply.send(reply);
    }

    pub fn send_down(&self, reason: DownReason) {
        self.send(Reply::Down { reason });
    }

    /// Acknowledge `size` items to the producer, if one is attached.
    pub fn ack(&self, size: usize) {
        if let Some(ack) = &self.ack {
            let _ = ack.send(size);
        }
    }
}

impl fmt::Debug for WaiterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterRef")
            .field("id", &self.id)
            .field("has_ack", &self.ack.is_some())
            .finish()
    }
}

/// One originating call's slice of a merged batch output.
#[derive(Debug, Clone)]
pub struct RefSize {
    pub waiter: WaiterRef,
    pub start: usize,
    pub size: usize,
}

/// Dispatcher queue depths and in-flight state, for introspection.
#[derive(Debug, Clone)]
pub struct DispatcherStatus {
    pub queued_keys: usize,
    pub pending_batches: usize,
    pub free_partitions: usize,
    pub in_flight_tasks: usize,
}

/// Commands processed by the dispatcher loop, one at a time.
#[derive(Debug)]
pub enum DispatcherCommand {
    /// A client submission.
    Submit { waiter: WaiterRef, batch: Batch },
    /// An accumulation timer fired. Stale tags are discarded.
    TimerFired { key: String, tag: u64 },
    /// A worker task finished and already replied to its waiters.
    TaskCompleted { task_id: Uuid },
    /// A worker task failed; the dispatcher notifies its waiters.
    TaskFailed { task_id: Uuid, reason: DownReason },
    /// Introspection.
    Status {
        resp: oneshot::Sender<DispatcherStatus>,
    },
    /// Graceful shutdown honouring the configured grace window.
    Shutdown { resp: oneshot::Sender<()> },
}

/// Strongly-typed sender for dispatcher commands.
#[derive(Debug, Clone)]
pub struct CommandSender(mpsc::Sender<DispatcherCommand>);

/// Strongly-typed receiver for dispatcher commands.
#[derive(Debug)]
pub struct CommandReceiver(mpsc::Receiver<DispatcherCommand>);

impl CommandSender {
    pub async fn send(
        &self,
        command: DispatcherCommand,
    ) -> Result<(), mpsc::error::SendError<DispatcherCommand>> {
        self.0.send(command).await
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Completes when the dispatcher side is gone.
    pub async fn closed(&self) {
        self.0.closed().await
    }
}

impl CommandReceiver {
    pub async fn recv(&mut self) -> Option<DispatcherCommand> {
        self.0.recv().await
    }
}

/// Create a dispatcher command channel pair.
pub fn command_channel(buffer_size: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (CommandSender(tx), CommandReceiver(rx))
}

/// Create a waiter reply channel pair.
pub fn reply_channel() -> (ReplySender, ReplyReceiver) {
    mpsc::unbounded_channel()
}

/// Create a producer acknowledgement channel pair.
pub fn ack_channel() -> (AckSender, AckReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_waiter_send_and_ack() {
        let (reply_tx, mut reply_rx) = reply_channel();
        let (ack_tx, mut ack_rx) = ack_channel();
        let waiter = WaiterRef::with_ack(reply_tx, ack_tx);

        waiter.send(Reply::Slice {
            start: 0,
            size: 1,
            output: Arc::new(vec![json!(4)]),
            metadata: json!("server_info"),
        });
        waiter.ack(1);

        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Reply::Slice { start: 0, size: 1, .. }
        ));
        assert_eq!(ack_rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_send_to_dropped_receiver_is_discarded() {
        let (reply_tx, reply_rx) = reply_channel();
        drop(reply_rx);
        let waiter = WaiterRef::new(reply_tx);
        waiter.send_down(DownReason::Noproc);
    }

    #[tokio::test]
    async fn test_command_channel_round_trip() {
        let (tx, mut rx) = command_channel(4);
        tx.send(DispatcherCommand::TimerFired {
            key: "default".to_string(),
            tag: 7,
        })
        .await
        .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(DispatcherCommand::TimerFired { tag: 7, .. })
        ));
    }
}
