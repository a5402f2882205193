//! # Inline Execution
//!
//! Runs a serving without a dispatcher. Batching is optional: with a
//! batch size set, oversize input is split into successive chunks run
//! sequentially; without one, the whole batch runs in one invocation.
//! Streaming output works by spawning a helper that emits the same reply
//! messages a server worker would, consumed through the same receive
//! protocol.

use std::sync::Arc;

use serde_json::Value;

use crate::batch::{Batch, DEFAULT_KEY};
use crate::client::{ClientHooks, ReplyStream, ServingInput, ServingResponse};
use crate::config::ServingMode;
use crate::dispatcher::hooks::{HookEmitter, HookSlots};
use crate::error::{BatchlineError, DownReason, Result};
use crate::handler::{BatchServing, PartitionContext, PartitionOptions, StartupKind};
use crate::messages::{reply_channel, RefSize, Reply, WaiterRef};

/// Dispatcherless runner around a serving.
pub struct InlineRunner<S: BatchServing> {
    serving: S,
    batch_size: Option<usize>,
    batch_keys: Vec<String>,
    mode: ServingMode,
    hooks: ClientHooks,
    hook_slots: HookSlots,
    initialized: bool,
}

impl<S: BatchServing> InlineRunner<S> {
    pub fn new(serving: S) -> Self {
        Self {
            serving,
            batch_size: None,
            batch_keys: vec![DEFAULT_KEY.to_string()],
            mode: ServingMode::Execute,
            hooks: ClientHooks::default(),
            hook_slots: HookSlots::new(1),
            initialized: false,
        }
    }

    /// Chunk input batches larger than `batch_size`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_batch_keys(mut self, batch_keys: Vec<String>) -> Self {
        self.batch_keys = batch_keys;
        self
    }

    pub fn with_mode(mut self, mode: ServingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_client_hooks(mut self, hooks: ClientHooks) -> Self {
        self.hooks = hooks;
        self
    }

    fn ensure_init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.serving.init(
            StartupKind::Inline,
            &[PartitionOptions {
                index: 0,
                batch_keys: self.batch_keys.clone(),
            }],
        )?;
        self.initialized = true;
        Ok(())
    }

    /// Run input to completion and return the concrete value.
    pub async fn run(&mut self, input: impl Into<ServingInput>) -> Result<ServingResponse> {
        self.ensure_init()?;
        let (input, info) = self.preprocess(input.into())?;
        let (items, metadata) = match input {
            ServingInput::Single(batch) => self.execute_batch(batch, None).await?,
            ServingInput::Stream(mut batches) => {
                let mut items = Vec::new();
                let mut metadata = Value::Null;
                while let Some(batch) = batches.recv().await {
                    let (output, reply_metadata) = self.execute_batch(batch, None).await?;
                    items.extend(output);
                    metadata = reply_metadata;
                }
                (items, metadata)
            }
        };
        self.postprocess(ServingResponse::Executed { items, metadata }, info)
    }

    /// Run input on a spawned helper, exposing the replies as a stream.
    /// Consumes the runner; the stream belongs to the caller.
    pub fn run_stream(mut self, input: impl Into<ServingInput>) -> Result<ServingResponse> {
        self.ensure_init()?;
        let (input, info) = self.preprocess(input.into())?;
        if self.mode == ServingMode::Hooks && matches!(input, ServingInput::Stream(_)) {
            return Err(BatchlineError::validation(
                "hooks mode requires a single batch, not a stream of batches",
            ));
        }

        let (reply_tx, reply_rx) = reply_channel();
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            let waiter = WaiterRef::new(reply_tx.clone());
            let outcome = self.emit_batches(input, &waiter).await;
            let _ = reply_tx.send(Reply::Down {
                reason: match outcome {
                    Ok(()) => DownReason::Normal,
                    Err(err) => DownReason::Error(err.to_string()),
                },
            });
        });

        let response = ServingResponse::Streamed(ReplyStream::new(reply_rx, None));
        match &hooks.postprocessing {
            Some(post) => post(response, info),
            None => Ok(response),
        }
    }

    async fn emit_batches(&mut self, input: ServingInput, waiter: &WaiterRef) -> Result<()> {
        match input {
            ServingInput::Single(batch) => {
                self.execute_batch(batch, Some(waiter)).await?;
            }
            ServingInput::Stream(mut batches) => {
                while let Some(batch) = batches.recv().await {
                    self.execute_batch(batch, Some(waiter)).await?;
                }
            }
        }
        Ok(())
    }

    /// Run one input batch, chunked to the batch size when one is set.
    /// With a waiter present each chunk's output is emitted as a reply;
    /// otherwise the outputs are aggregated and returned.
    async fn execute_batch(
        &mut self,
        batch: Batch,
        waiter: Option<&WaiterRef>,
    ) -> Result<(Vec<Value>, Value)> {
        if batch.is_empty() {
            return Err(BatchlineError::validation("cannot run an empty batch"));
        }
        let mut items = Vec::with_capacity(batch.size());
        let mut metadata = Value::Null;
        let mut rest = batch;
        loop {
            let take = match self.batch_size {
                Some(limit) => limit.min(rest.size()),
                None => rest.size(),
            };
            let (chunk, suffix) = rest.split(take);
            let (output, chunk_metadata) = self.invoke(chunk, waiter).await?;
            if let Some(waiter) = waiter {
                let size = output.len();
                waiter.send(Reply::Slice {
                    start: 0,
                    size,
                    output: Arc::new(output),
                    metadata: chunk_metadata.clone(),
                });
            } else {
                items.extend(output);
            }
            metadata = chunk_metadata;
            if suffix.is_empty() {
                break;
            }
            rest = suffix;
        }
        Ok((items, metadata))
    }

    async fn invoke(
        &mut self,
        batch: Batch,
        waiter: Option<&WaiterRef>,
    ) -> Result<(Vec<Value>, Value)> {
        let size = batch.size();
        let ctx = if self.mode == ServingMode::Hooks {
            if let Some(waiter) = waiter {
                self.hook_slots.set(
                    0,
                    Arc::new(vec![RefSize {
                        waiter: waiter.clone(),
                        start: 0,
                        size,
                    }]),
                );
            }
            PartitionContext::with_hooks(0, HookEmitter::new(0, self.hook_slots.clone()))
        } else {
            PartitionContext::new(0)
        };

        let thunk = self.serving.handle_batch(batch, &ctx)?;
        let result = thunk().await;
        self.hook_slots.clear(0);
        let (output, metadata) = result?;
        if output.len() != size {
            return Err(BatchlineError::internal(format!(
                "compute returned {} items for a batch of {size}",
                output.len()
            )));
        }
        Ok((output, metadata))
    }

    fn preprocess(&self, input: ServingInput) -> Result<(ServingInput, Value)> {
        match &self.hooks.preprocessing {
            Some(pre) => pre(input),
            None => Ok((input, Value::String("client_info".to_string()))),
        }
    }

    fn postprocess(&self, response: ServingResponse, info: Value) -> Result<ServingResponse> {
        match &self.hooks.postprocessing {
            Some(post) => post(response, info),
            None => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnServing;
    use futures::StreamExt;
    use serde_json::json;

    fn squares() -> FnServing {
        FnServing::from_sync(|items| {
            items
                .iter()
                .map(|v| json!(v.as_i64().unwrap() * v.as_i64().unwrap()))
                .collect()
        })
    }

    #[tokio::test]
    async fn test_run_without_batch_size_is_one_invocation() {
        let mut runner = InlineRunner::new(squares());
        let (items, metadata) = runner
            .run(Batch::stack(vec![json!(1), json!(2), json!(3), json!(4)]))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(items, vec![json!(1), json!(4), json!(9), json!(16)]);
        assert_eq!(metadata, json!("server_info"));
    }

    #[tokio::test]
    async fn test_run_chunks_oversize_batches() {
        let mut runner = InlineRunner::new(squares()).with_batch_size(3);
        let (items, _) = runner
            .run(Batch::stack((1..=8).map(|n| json!(n)).collect()))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        let expected: Vec<Value> = (1..=8).map(|n| json!(n * n)).collect();
        assert_eq!(items, expected);
    }

    #[tokio::test]
    async fn test_run_rejects_empty_batch() {
        let mut runner = InlineRunner::new(squares());
        let err = runner.run(Batch::stack(vec![])).await.unwrap_err();
        assert!(matches!(err, BatchlineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_run_stream_emits_one_reply_per_chunk() {
        let runner = InlineRunner::new(squares())
            .with_batch_size(2)
            .with_mode(ServingMode::Batches);
        let mut stream = runner
            .run_stream(Batch::stack(vec![json!(1), json!(2), json!(3)]))
            .unwrap()
            .into_stream()
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                crate::client::StreamEvent::Batch { items, .. } => chunks.push(items),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(chunks, vec![vec![json!(1), json!(4)], vec![json!(9)]]);
    }

    #[tokio::test]
    async fn test_run_over_stream_input_aggregates() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Batch::stack(vec![json!(1), json!(2)])).await.unwrap();
        tx.send(Batch::stack(vec![json!(3)])).await.unwrap();
        drop(tx);

        let mut runner = InlineRunner::new(squares());
        let (items, _) = runner.run(rx).await.unwrap().into_value().unwrap();
        assert_eq!(items, vec![json!(1), json!(4), json!(9)]);
    }
}
