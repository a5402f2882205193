//! # Client Submission and Receive Protocol
//!
//! `batched_run` is the caller-facing entry point: preprocess, validate,
//! submit to the named dispatcher, then receive sliced replies until the
//! expected item total is covered. Execute mode reassembles a concrete
//! value; the streaming modes hand back a [`ReplyStream`] owned by the
//! submitting caller.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::batch::Batch;
use crate::config::ServingMode;
use crate::error::{BatchlineError, DownReason, Result};
use crate::messages::{
    ack_channel, reply_channel, DispatcherCommand, Reply, ReplyReceiver, ReplySender, WaiterRef,
};
use crate::registry::{self, ServingRecord};

/// What a caller submits: one batch, or a lazy sequence of batches fed
/// through a channel.
pub enum ServingInput {
    Single(Batch),
    Stream(mpsc::Receiver<Batch>),
}

impl From<Batch> for ServingInput {
    fn from(batch: Batch) -> Self {
        ServingInput::Single(batch)
    }
}

impl From<mpsc::Receiver<Batch>> for ServingInput {
    fn from(batches: mpsc::Receiver<Batch>) -> Self {
        ServingInput::Stream(batches)
    }
}

impl std::fmt::Debug for ServingInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServingInput::Single(batch) => f.debug_tuple("Single").field(batch).finish(),
            ServingInput::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// What a run produces: a concrete value in execute mode, a stream in
/// the streaming modes.
#[derive(Debug)]
pub enum ServingResponse {
    Executed { items: Vec<Value>, metadata: Value },
    Streamed(ReplyStream),
}

impl ServingResponse {
    /// Unwrap an execute-mode response.
    pub fn into_value(self) -> Result<(Vec<Value>, Value)> {
        match self {
            ServingResponse::Executed { items, metadata } => Ok((items, metadata)),
            ServingResponse::Streamed(_) => Err(BatchlineError::validation(
                "expected an executed response, got a stream",
            )),
        }
    }

    /// Unwrap a streaming-mode response.
    pub fn into_stream(self) -> Result<ReplyStream> {
        match self {
            ServingResponse::Streamed(stream) => Ok(stream),
            ServingResponse::Executed { .. } => Err(BatchlineError::validation(
                "expected a streamed response, got a value",
            )),
        }
    }
}

/// Events yielded by a [`ReplyStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One sliced batch reply.
    Batch { items: Vec<Value>, metadata: Value },
    /// A named hook emission (hooks mode only).
    Hook { name: String, items: Vec<Value> },
}

pub type PreprocessingFn = dyn Fn(ServingInput) -> Result<(ServingInput, Value)> + Send + Sync;
pub type PostprocessingFn = dyn Fn(ServingResponse, Value) -> Result<ServingResponse> + Send + Sync;
pub type DistributedPreprocessingFn = dyn Fn(ServingInput) -> Result<ServingInput> + Send + Sync;
pub type DistributedPostprocessingFn = dyn Fn(Reply) -> Reply + Send + Sync;

/// Caller-side hooks attached to a dispatcher at startup. Defaults pass
/// input and output through untouched, with `"client_info"` as the
/// preprocessing info value.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub preprocessing: Option<Arc<PreprocessingFn>>,
    pub postprocessing: Option<Arc<PostprocessingFn>>,
    pub distributed_preprocessing: Option<Arc<DistributedPreprocessingFn>>,
    pub distributed_postprocessing: Option<Arc<DistributedPostprocessingFn>>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preprocessing<F>(mut self, f: F) -> Self
    where
        F: Fn(ServingInput) -> Result<(ServingInput, Value)> + Send + Sync + 'static,
    {
        self.preprocessing = Some(Arc::new(f));
        self
    }

    pub fn with_postprocessing<F>(mut self, f: F) -> Self
    where
        F: Fn(ServingResponse, Value) -> Result<ServingResponse> + Send + Sync + 'static,
    {
        self.postprocessing = Some(Arc::new(f));
        self
    }

    pub fn with_distributed_preprocessing<F>(mut self, f: F) -> Self
    where
        F: Fn(ServingInput) -> Result<ServingInput> + Send + Sync + 'static,
    {
        self.distributed_preprocessing = Some(Arc::new(f));
        self
    }

    pub fn with_distributed_postprocessing<F>(mut self, f: F) -> Self
    where
        F: Fn(Reply) -> Reply + Send + Sync + 'static,
    {
        self.distributed_postprocessing = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHooks")
            .field("preprocessing", &self.preprocessing.is_some())
            .field("postprocessing", &self.postprocessing.is_some())
            .field(
                "distributed_preprocessing",
                &self.distributed_preprocessing.is_some(),
            )
            .field(
                "distributed_postprocessing",
                &self.distributed_postprocessing.is_some(),
            )
            .finish()
    }
}

/// Client handle to a named local dispatcher.
#[derive(Debug, Clone)]
pub struct ServingClient {
    record: Arc<ServingRecord>,
}

impl ServingClient {
    /// Resolve a local dispatcher by name.
    pub fn local(name: &str) -> Result<Self> {
        registry::lookup(name)
            .map(|record| Self { record })
            .ok_or_else(|| BatchlineError::dispatcher_not_found(name))
    }

    /// Submit input and receive the response per the dispatcher's mode.
    pub async fn run(&self, input: impl Into<ServingInput>) -> Result<ServingResponse> {
        run_with_record(Arc::clone(&self.record), input.into()).await
    }
}

/// Submit `input` to the local dispatcher named `name`.
pub async fn batched_run(name: &str, input: impl Into<ServingInput>) -> Result<ServingResponse> {
    ServingClient::local(name)?.run(input).await
}

pub(crate) async fn run_with_record(
    record: Arc<ServingRecord>,
    input: ServingInput,
) -> Result<ServingResponse> {
    run_record_inner(record, input, None).await
}

/// Run against a remote dispatcher record, forwarding every reply
/// through the serving's `distributed_postprocessing` transform. The
/// proxy closing its channel is the end-of-exchange sentinel.
pub(crate) async fn run_with_record_proxied(
    record: Arc<ServingRecord>,
    input: ServingInput,
    transform: Arc<DistributedPostprocessingFn>,
) -> Result<ServingResponse> {
    run_record_inner(record, input, Some(transform)).await
}

async fn run_record_inner(
    record: Arc<ServingRecord>,
    input: ServingInput,
    transform: Option<Arc<DistributedPostprocessingFn>>,
) -> Result<ServingResponse> {
    let hooks = record.hooks.clone();
    let (input, info) = match &hooks.preprocessing {
        Some(pre) => pre(input)?,
        None => (input, Value::String("client_info".to_string())),
    };

    let (reply_tx, reply_rx) = match transform {
        None => reply_channel(),
        Some(transform) => {
            let (remote_tx, mut remote_rx) = reply_channel();
            let (local_tx, local_rx) = reply_channel();
            tokio::spawn(async move {
                while let Some(reply) = remote_rx.recv().await {
                    if local_tx.send(transform(reply)).is_err() {
                        break;
                    }
                }
            });
            (remote_tx, local_rx)
        }
    };
    let expected = match input {
        ServingInput::Single(batch) => {
            validate_batch(&record, &batch)?;
            let size = batch.size();
            let waiter = WaiterRef::new(reply_tx.clone());
            record
                .commands
                .send(DispatcherCommand::Submit { waiter, batch })
                .await
                .map_err(|_| BatchlineError::dispatcher_not_found(&record.name))?;
            Some(size)
        }
        ServingInput::Stream(batches) => {
            if record.mode == ServingMode::Hooks {
                return Err(BatchlineError::validation(
                    "hooks mode requires a single batch, not a stream of batches",
                ));
            }
            spawn_producer(batches, Arc::clone(&record), reply_tx.clone());
            None
        }
    };
    drop(reply_tx);

    let response = match record.mode {
        ServingMode::Execute => {
            let (items, metadata) = receive_executed(reply_rx, expected).await?;
            ServingResponse::Executed { items, metadata }
        }
        ServingMode::Batches | ServingMode::Hooks => {
            ServingResponse::Streamed(ReplyStream::new(reply_rx, expected))
        }
    };

    match &hooks.postprocessing {
        Some(post) => post(response, info),
        None => Ok(response),
    }
}

fn validate_batch(record: &ServingRecord, batch: &Batch) -> Result<()> {
    if batch.is_empty() {
        return Err(BatchlineError::validation("cannot submit an empty batch"));
    }
    if !record.batch_keys.contains(batch.key()) {
        return Err(BatchlineError::validation(format!(
            "batch key '{}' is not served by dispatcher '{}'",
            batch.key(),
            record.name
        )));
    }
    if record.mode == ServingMode::Hooks && batch.size() > record.limit {
        return Err(BatchlineError::validation(format!(
            "batch of size {} exceeds the limit {} in hooks mode",
            batch.size(),
            record.limit
        )));
    }
    Ok(())
}

/// Submit a stream of batches with producer backpressure: each batch
/// waits for the previous one's acknowledgement, bounding in-flight work
/// per caller to one batch. Reports the final item total once drained.
fn spawn_producer(
    mut batches: mpsc::Receiver<Batch>,
    record: Arc<ServingRecord>,
    reply_tx: ReplySender,
) {
    tokio::spawn(async move {
        let (ack_tx, mut ack_rx) = ack_channel();
        let mut outstanding = 0usize;
        let mut total = 0usize;

        while let Some(batch) = batches.recv().await {
            if let Err(err) = validate_batch(&record, &batch) {
                let _ = reply_tx.send(Reply::Down {
                    reason: DownReason::Error(err.to_string()),
                });
                return;
            }
            while outstanding > 0 {
                tokio::select! {
                    acked = ack_rx.recv() => match acked {
                        Some(size) => outstanding = outstanding.saturating_sub(size),
                        None => return,
                    },
                    _ = record.commands.closed() => {
                        let _ = reply_tx.send(Reply::Down {
                            reason: DownReason::Noproc,
                        });
                        return;
                    }
                }
            }
            let size = batch.size();
            let waiter = WaiterRef::with_ack(reply_tx.clone(), ack_tx.clone());
            if record
                .commands
                .send(DispatcherCommand::Submit { waiter, batch })
                .await
                .is_err()
            {
                let _ = reply_tx.send(Reply::Down {
                    reason: DownReason::Noproc,
                });
                return;
            }
            outstanding += size;
            total += size;
        }

        while outstanding > 0 {
            tokio::select! {
                acked = ack_rx.recv() => match acked {
                    Some(size) => outstanding = outstanding.saturating_sub(size),
                    None => return,
                },
                _ = record.commands.closed() => {
                    let _ = reply_tx.send(Reply::Down {
                        reason: DownReason::Noproc,
                    });
                    return;
                }
            }
        }
        debug!(dispatcher = %record.name, total, "Producer drained");
        let _ = reply_tx.send(Reply::ProducerFinished { total });
    });
}

fn slice_output(output: &Arc<Vec<Value>>, start: usize, size: usize) -> Result<Vec<Value>> {
    output
        .get(start..start + size)
        .map(<[Value]>::to_vec)
        .ok_or_else(|| {
            BatchlineError::batch_failed(DownReason::Error(format!(
                "reply output of length {} does not cover slice [{start}, {})",
                output.len(),
                start + size
            )))
        })
}

async fn receive_executed(
    mut rx: ReplyReceiver,
    mut expected: Option<usize>,
) -> Result<(Vec<Value>, Value)> {
    let mut items = Vec::new();
    let mut metadata = Value::Null;
    let mut received = 0usize;

    loop {
        if let Some(total) = expected {
            if received >= total {
                break;
            }
        }
        match rx.recv().await {
            Some(Reply::Slice {
                start,
                size,
                output,
                metadata: reply_metadata,
            }) => {
                items.extend(slice_output(&output, start, size)?);
                metadata = reply_metadata;
                received += size;
            }
            Some(Reply::ProducerFinished { total }) => expected = Some(total),
            Some(Reply::Hook { .. }) => {}
            Some(Reply::Down {
                reason: DownReason::Normal,
            }) => break,
            Some(Reply::Down { reason }) => return Err(BatchlineError::batch_failed(reason)),
            None => return Err(BatchlineError::batch_failed(DownReason::Noproc)),
        }
    }
    Ok((items, metadata))
}

/// Lazy sequence of reply events, owned by the submitting caller.
///
/// Ownership is the single-consumer guarantee: the stream cannot be
/// cloned, so nobody else can read it.
#[derive(Debug)]
pub struct ReplyStream {
    rx: ReplyReceiver,
    expected: Option<usize>,
    received: usize,
    done: bool,
}

impl ReplyStream {
    pub(crate) fn new(rx: ReplyReceiver, expected: Option<usize>) -> Self {
        Self {
            rx,
            expected,
            received: 0,
            done: false,
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(total) = this.expected {
                if this.received >= total {
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(BatchlineError::batch_failed(
                        DownReason::Noproc,
                    ))));
                }
                Poll::Ready(Some(reply)) => match reply {
                    Reply::Slice {
                        start,
                        size,
                        output,
                        metadata,
                    } => {
                        this.received += size;
                        return Poll::Ready(Some(
                            slice_output(&output, start, size)
                                .map(|items| StreamEvent::Batch { items, metadata }),
                        ));
                    }
                    Reply::Hook {
                        name,
                        start,
                        size,
                        output,
                    } => {
                        return Poll::Ready(Some(
                            slice_output(&output, start, size)
                                .map(|items| StreamEvent::Hook { name, items }),
                        ));
                    }
                    Reply::ProducerFinished { total } => {
                        this.expected = Some(total);
                    }
                    Reply::Down {
                        reason: DownReason::Normal,
                    } => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                    Reply::Down { reason } => {
                        this.done = true;
                        return Poll::Ready(Some(Err(BatchlineError::batch_failed(reason))));
                    }
                },
            }
        }
    }
}
