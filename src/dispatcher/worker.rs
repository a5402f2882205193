//! # Partition Worker
//!
//! Each sealed batch runs as its own spawned task on a free partition.
//! On success the task replies to every originating waiter with the
//! shared output and that waiter's slice coordinates, acknowledges
//! streaming producers, and notifies the dispatcher it is done. Failures
//! are reported back so the dispatcher can fan `Down` out from its task
//! record; a monitor task converts panics into the same notification.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::DownReason;
use crate::handler::BatchThunk;
use crate::messages::{CommandSender, DispatcherCommand, RefSize, Reply};

/// Dispatcher-side record of one in-flight batch task.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub partition: usize,
    pub ref_sizes: Arc<Vec<RefSize>>,
}

/// Spawn the batch task and its panic monitor.
pub(crate) fn spawn_batch_task(
    task_id: Uuid,
    partition: usize,
    thunk: BatchThunk,
    ref_sizes: Arc<Vec<RefSize>>,
    commands: CommandSender,
) {
    let monitor_commands = commands.clone();
    let handle = tokio::spawn(async move {
        match thunk().await {
            Ok((output, metadata)) => {
                let expected: usize = ref_sizes.iter().map(|rs| rs.size).sum();
                if output.len() != expected {
                    let _ = commands
                        .send(DispatcherCommand::TaskFailed {
                            task_id,
                            reason: DownReason::Error(format!(
                                "compute returned {} items for a batch of {expected}",
                                output.len()
                            )),
                        })
                        .await;
                    return;
                }
                let output = Arc::new(output);
                for rs in ref_sizes.iter() {
                    rs.waiter.send(Reply::Slice {
                        start: rs.start,
                        size: rs.size,
                        output: Arc::clone(&output),
                        metadata: metadata.clone(),
                    });
                }
                // Acks go out after the replies so a producer's next batch
                // can never overtake its predecessor's output.
                for rs in ref_sizes.iter() {
                    rs.waiter.ack(rs.size);
                }
                let _ = commands
                    .send(DispatcherCommand::TaskCompleted { task_id })
                    .await;
            }
            Err(err) => {
                let _ = commands
                    .send(DispatcherCommand::TaskFailed {
                        task_id,
                        reason: DownReason::Error(err.to_string()),
                    })
                    .await;
            }
        }
    });

    tokio::spawn(async move {
        if let Err(join_err) = handle.await {
            let reason = if join_err.is_panic() {
                DownReason::Panic(panic_message(join_err.into_panic()))
            } else {
                DownReason::Error("batch task aborted".to_string())
            };
            debug!(task_id = %task_id, partition, reason = %reason, "Batch task went down");
            let _ = monitor_commands
                .send(DispatcherCommand::TaskFailed { task_id, reason })
                .await;
        }
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
