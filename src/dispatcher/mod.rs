//! # Batch Dispatcher
//!
//! The single-writer state machine at the heart of the engine. One task
//! owns every accumulator, queue, pending batch and in-flight task
//! record, and processes one command at a time: submissions grow per-key
//! accumulators, size or timeout seals them, and `maybe_task` pairs each
//! sealed batch with the next free worker partition. Workers reply to
//! waiters directly; the dispatcher only learns `done` or `failed`.

pub mod hooks;

mod accumulator;
mod queues;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::Batch;
use crate::client::{ClientHooks, ServingClient};
use crate::config::{ServingMode, ServingOptions};
use crate::error::{BatchlineError, DownReason, Result};
use crate::handler::{BatchServing, PartitionContext, PartitionOptions, StartupKind};
use crate::messages::{
    command_channel, CommandReceiver, CommandSender, DispatcherCommand, DispatcherStatus,
    WaiterRef,
};
use crate::registry::{self, ServingRecord};

use accumulator::Accumulator;
use hooks::{HookEmitter, HookSlots};
use queues::{InQueue, OutQueue, PendingBatches, SealedBatch};
use worker::TaskRecord;

/// Start a dispatcher with default client hooks.
pub fn start<S: BatchServing>(serving: S, options: ServingOptions) -> Result<ServingHandle> {
    start_with_hooks(serving, options, ClientHooks::default())
}

/// Start a dispatcher, attaching caller-side pre/postprocessing hooks to
/// its registry record.
pub fn start_with_hooks<S: BatchServing>(
    mut serving: S,
    options: ServingOptions,
    hooks: ClientHooks,
) -> Result<ServingHandle> {
    crate::logging::init_logging();
    options.validate()?;

    let partition_options: Vec<PartitionOptions> = (0..options.partitions)
        .map(|index| PartitionOptions {
            index,
            batch_keys: options.batch_keys.clone(),
        })
        .collect();
    serving.init(StartupKind::Process, &partition_options)?;

    let (command_sender, command_receiver) = command_channel(options.command_buffer_size);
    let record = Arc::new(ServingRecord::new(&options, hooks, command_sender.clone()));
    registry::register(record)?;

    info!(
        dispatcher = %options.name,
        batch_size = options.batch_size,
        partitions = options.partitions,
        mode = ?options.mode,
        "Dispatcher started"
    );

    let accumulators = options
        .batch_keys
        .iter()
        .map(|key| (key.clone(), Accumulator::new()))
        .collect();
    let dispatcher = Dispatcher {
        hook_slots: HookSlots::new(options.partitions),
        out_queue: OutQueue::new(options.partitions),
        in_queue: InQueue::default(),
        pending: PendingBatches::default(),
        tasks: HashMap::new(),
        accumulators,
        timer_seq: 0,
        command_sender: command_sender.clone(),
        serving,
        options,
    };
    let name = dispatcher.options.name.clone();
    let join = tokio::spawn(dispatcher.run(command_receiver));

    Ok(ServingHandle {
        name,
        commands: command_sender,
        join,
    })
}

/// Owner handle for a running dispatcher.
#[derive(Debug)]
pub struct ServingHandle {
    name: String,
    commands: CommandSender,
    join: JoinHandle<()>,
}

impl ServingHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client bound to this dispatcher.
    pub fn client(&self) -> Result<ServingClient> {
        ServingClient::local(&self.name)
    }

    /// Current queue depths and in-flight state.
    pub async fn status(&self) -> Result<DispatcherStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(DispatcherCommand::Status { resp: tx })
            .await
            .map_err(|_| BatchlineError::dispatcher_not_found(&self.name))?;
        rx.await
            .map_err(|_| BatchlineError::dispatcher_not_found(&self.name))
    }

    /// Gracefully stop the dispatcher: queued work fails with `noproc`,
    /// in-flight batches get the configured grace window to finish.
    pub async fn shutdown(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(DispatcherCommand::Shutdown { resp: tx })
            .await
            .map_err(|_| BatchlineError::dispatcher_not_found(&self.name))?;
        rx.await
            .map_err(|_| BatchlineError::dispatcher_not_found(&self.name))?;
        let _ = self.join.await;
        Ok(())
    }
}

struct Dispatcher<S: BatchServing> {
    options: ServingOptions,
    serving: S,
    command_sender: CommandSender,
    accumulators: HashMap<String, Accumulator>,
    pending: PendingBatches,
    in_queue: InQueue,
    out_queue: OutQueue,
    tasks: HashMap<Uuid, TaskRecord>,
    hook_slots: HookSlots,
    timer_seq: u64,
}

impl<S: BatchServing> Dispatcher<S> {
    async fn run(mut self, mut commands: CommandReceiver) {
        let mut shutdown_resp = None;
        while let Some(command) = commands.recv().await {
            match command {
                DispatcherCommand::Shutdown { resp } => {
                    shutdown_resp = Some(resp);
                    break;
                }
                other => self.handle_command(other),
            }
        }

        registry::deregister(&self.options.name);
        self.drain(&mut commands).await;
        if let Some(resp) = shutdown_resp {
            let _ = resp.send(());
        }
        info!(dispatcher = %self.options.name, "Dispatcher stopped");
    }

    fn handle_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Submit { waiter, batch } => {
                if batch.is_empty() {
                    waiter.send_down(DownReason::Error("empty batch".to_string()));
                    return;
                }
                if self.accumulate(waiter, batch) {
                    self.maybe_task();
                }
            }
            DispatcherCommand::TimerFired { key, tag } => self.handle_timer(&key, tag),
            DispatcherCommand::TaskCompleted { task_id } => {
                if let Some(record) = self.tasks.remove(&task_id) {
                    debug!(
                        dispatcher = %self.options.name,
                        task_id = %task_id,
                        partition = record.partition,
                        "Batch task completed"
                    );
                    self.hook_slots.clear(record.partition);
                    self.out_queue.push_back(record.partition);
                    self.maybe_task();
                }
            }
            DispatcherCommand::TaskFailed { task_id, reason } => {
                if let Some(record) = self.tasks.remove(&task_id) {
                    warn!(
                        dispatcher = %self.options.name,
                        task_id = %task_id,
                        partition = record.partition,
                        reason = %reason,
                        "Batch task failed"
                    );
                    for rs in record.ref_sizes.iter() {
                        rs.waiter.send_down(reason.clone());
                    }
                    self.hook_slots.clear(record.partition);
                    self.out_queue.push_back(record.partition);
                    self.maybe_task();
                }
            }
            DispatcherCommand::Status { resp } => {
                let _ = resp.send(DispatcherStatus {
                    queued_keys: self.in_queue.len(),
                    pending_batches: self.pending.len(),
                    free_partitions: self.out_queue.len(),
                    in_flight_tasks: self.tasks.len(),
                });
            }
            // Shutdown is intercepted by the run loop.
            DispatcherCommand::Shutdown { resp } => {
                let _ = resp.send(());
            }
        }
    }

    fn acc_mut(&mut self, key: &str) -> &mut Accumulator {
        self.accumulators
            .get_mut(key)
            .expect("accumulator exists for every declared key")
    }

    /// Fold one submission into its key's accumulator. Returns whether
    /// any batch was sealed.
    fn accumulate(&mut self, waiter: WaiterRef, batch: Batch) -> bool {
        let key = batch.key().to_string();
        if !self.accumulators.contains_key(&key) {
            waiter.send_down(DownReason::Error(format!("unknown batch key '{key}'")));
            return false;
        }

        let limit = self.options.batch_size;
        let size = batch.size();
        let count = self.acc_mut(&key).count();

        if size == limit {
            // Runs as its own batch, after whatever was already waiting.
            let mut sealed = false;
            if !self.acc_mut(&key).is_empty() {
                sealed |= self.seal_key(&key);
            }
            self.acc_mut(&key).push(waiter, batch);
            sealed | self.seal_key(&key)
        } else if size + count > limit && self.options.mode == ServingMode::Hooks {
            // Hooks mode never splits; size <= limit was enforced at entry.
            let sealed = self.seal_key(&key);
            self.acc_mut(&key).push(waiter, batch);
            self.arm_timer_if_idle(&key);
            sealed
        } else if size + count > limit {
            let (prefix, suffix) = batch.split(limit - count);
            self.acc_mut(&key).push(waiter.clone(), prefix);
            self.seal_key(&key);
            self.accumulate(waiter, suffix);
            true
        } else if size + count == limit {
            self.acc_mut(&key).push(waiter, batch);
            self.seal_key(&key)
        } else {
            self.acc_mut(&key).push(waiter, batch);
            self.arm_timer_if_idle(&key);
            false
        }
    }

    /// Seal the accumulator for `key` into the pending queue. The key is
    /// enqueued for dispatch unless its timer already did so.
    fn seal_key(&mut self, key: &str) -> bool {
        let was_done = self.acc_mut(key).timer_is_done();
        let Some(sealed) = self.acc_mut(key).seal() else {
            return false;
        };
        debug!(
            dispatcher = %self.options.name,
            key,
            size = sealed.batch.size(),
            callers = sealed.ref_sizes.len(),
            "Sealed batch"
        );
        self.pending.push(key, sealed);
        if !was_done {
            self.in_queue.push(key);
        }
        true
    }

    fn arm_timer_if_idle(&mut self, key: &str) {
        if !self.acc_mut(key).timer_is_idle() {
            return;
        }
        self.timer_seq += 1;
        let tag = self.timer_seq;
        let commands = self.command_sender.clone();
        let timeout = self.options.batch_timeout();
        let key_owned = key.to_string();
        let abort = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands
                .send(DispatcherCommand::TimerFired {
                    key: key_owned,
                    tag,
                })
                .await;
        })
        .abort_handle();
        self.acc_mut(key).arm_timer(tag, abort);
    }

    fn handle_timer(&mut self, key: &str, tag: u64) {
        let Some(acc) = self.accumulators.get(key) else {
            return;
        };
        if !acc.timer_matches(tag) {
            debug!(dispatcher = %self.options.name, key, tag, "Stale accumulation timer ignored");
            return;
        }
        if self.out_queue.is_empty() {
            // No partition free: leave the entries in place so the batch
            // can still grow, and let the next freed partition seal it.
            self.acc_mut(key).mark_timer_done();
            self.in_queue.push(key);
        } else {
            self.seal_key(key);
            self.maybe_task();
        }
    }

    /// Pair free partitions with ready batches until one side runs dry.
    fn maybe_task(&mut self) {
        loop {
            let Some(partition) = self.out_queue.pop() else {
                return;
            };
            let Some(key) = self.in_queue.pop() else {
                self.out_queue.push_front(partition);
                return;
            };
            let sealed = match self.pending.pop(&key) {
                Some(sealed) => Some(sealed),
                None => {
                    // The key was enqueued because its timer went done;
                    // its batch is still in the accumulator.
                    if self.seal_key(&key) {
                        self.pending.pop(&key)
                    } else {
                        None
                    }
                }
            };
            match sealed {
                Some(sealed) => self.dispatch(partition, sealed),
                None => self.out_queue.push_front(partition),
            }
        }
    }

    fn dispatch(&mut self, partition: usize, sealed: SealedBatch) {
        let SealedBatch { batch, ref_sizes } = sealed;
        let ref_sizes = Arc::new(ref_sizes);
        let hooks_mode = self.options.mode == ServingMode::Hooks;
        let ctx = if hooks_mode {
            PartitionContext::with_hooks(
                partition,
                HookEmitter::new(partition, self.hook_slots.clone()),
            )
        } else {
            PartitionContext::new(partition)
        };

        let key = batch.key().to_string();
        let size = batch.size();
        let thunk = match self.serving.handle_batch(batch, &ctx) {
            Ok(thunk) => thunk,
            Err(err) => {
                error!(
                    dispatcher = %self.options.name,
                    key,
                    partition,
                    error = %err,
                    "Handler rejected batch"
                );
                for rs in ref_sizes.iter() {
                    rs.waiter.send_down(DownReason::Error(err.to_string()));
                }
                self.out_queue.push_back(partition);
                return;
            }
        };

        if hooks_mode {
            self.hook_slots.set(partition, Arc::clone(&ref_sizes));
        }
        let task_id = Uuid::new_v4();
        debug!(
            dispatcher = %self.options.name,
            key,
            partition,
            task_id = %task_id,
            size,
            "Dispatching batch"
        );
        worker::spawn_batch_task(
            task_id,
            partition,
            thunk,
            Arc::clone(&ref_sizes),
            self.command_sender.clone(),
        );
        self.tasks.insert(task_id, TaskRecord {
            partition,
            ref_sizes,
        });
    }

    /// Fail everything not yet running, then give in-flight batches the
    /// configured grace window.
    async fn drain(&mut self, commands: &mut CommandReceiver) {
        for sealed in self.pending.drain_all() {
            for rs in sealed.ref_sizes {
                rs.waiter.send_down(DownReason::Noproc);
            }
        }
        for acc in self.accumulators.values_mut() {
            if let Some(sealed) = acc.seal() {
                for rs in sealed.ref_sizes {
                    rs.waiter.send_down(DownReason::Noproc);
                }
            }
        }

        if self.tasks.is_empty() {
            return;
        }
        info!(
            dispatcher = %self.options.name,
            in_flight = self.tasks.len(),
            "Waiting for in-flight batches"
        );
        let deadline = tokio::time::sleep(self.options.shutdown_grace());
        tokio::pin!(deadline);
        while !self.tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        dispatcher = %self.options.name,
                        abandoned = self.tasks.len(),
                        "Shutdown grace window expired"
                    );
                    for (_, record) in self.tasks.drain() {
                        for rs in record.ref_sizes.iter() {
                            rs.waiter.send_down(DownReason::Noproc);
                        }
                    }
                    break;
                }
                command = commands.recv() => match command {
                    Some(DispatcherCommand::TaskCompleted { task_id }) => {
                        self.tasks.remove(&task_id);
                    }
                    Some(DispatcherCommand::TaskFailed { task_id, reason }) => {
                        if let Some(record) = self.tasks.remove(&task_id) {
                            for rs in record.ref_sizes.iter() {
                                rs.waiter.send_down(reason.clone());
                            }
                        }
                    }
                    Some(DispatcherCommand::Submit { waiter, .. }) => {
                        waiter.send_down(DownReason::Noproc);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
}
