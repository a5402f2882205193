//! # Batchline
//!
//! A batching request dispatcher: many concurrent callers submit small
//! batches, the dispatcher accumulates them per key under a size and
//! time bound, a partitioned worker pool runs the serving's compute
//! function over each sealed batch, and the aggregate output is sliced
//! back to every originating caller.
//!
//! ```rust,ignore
//! use batchline::{batched_run, start, Batch, FnServing, ServingOptions};
//!
//! let serving = FnServing::from_sync(|items| {
//!     items.iter().map(|v| square(v)).collect()
//! });
//! let handle = start(serving, ServingOptions::new("squares").with_batch_size(8))?;
//!
//! let response = batched_run("squares", Batch::stack(vec![1.into(), 2.into()])).await?;
//! let (items, _metadata) = response.into_value()?;
//! ```

pub mod batch;
pub mod client;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod inline;
pub mod logging;
pub mod messages;
pub mod registry;

pub use batch::{Batch, DEFAULT_KEY};
pub use client::{
    batched_run, ClientHooks, ReplyStream, ServingClient, ServingInput, ServingResponse,
    StreamEvent,
};
pub use cluster::{ClusterClient, MembershipLookup, StaticMembership};
pub use config::{ServingMode, ServingOptions};
pub use dispatcher::{start, start_with_hooks, ServingHandle};
pub use error::{BatchlineError, DownReason, Result};
pub use handler::{
    BatchFuture, BatchOutput, BatchServing, BatchThunk, FnServing, PartitionContext,
    PartitionOptions, StartupKind,
};
pub use inline::InlineRunner;
pub use messages::DispatcherStatus;
