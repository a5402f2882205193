//! # User Handler Contract
//!
//! The serving handler is a capability set: `init` runs once at startup,
//! `handle_batch` turns a sealed batch into a thunk the worker partition
//! executes. State lives on the handler itself; the dispatcher owns the
//! handler exclusively, so `&mut self` needs no locking.
//!
//! [`FnServing`] is the default implementation wrapping a plain compute
//! function, in both the single-function and key-dispatching forms.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::batch::Batch;
use crate::dispatcher::hooks::HookEmitter;
use crate::error::{BatchlineError, Result};

/// Output of one batch execution: the ordered output items and opaque
/// metadata handed back to every originating caller.
pub type BatchOutput = (Vec<Value>, Value);

/// The future a batch thunk produces.
pub type BatchFuture = BoxFuture<'static, Result<BatchOutput>>;

/// A deferred batch execution, run on a worker partition.
pub type BatchThunk = Box<dyn FnOnce() -> BatchFuture + Send + 'static>;

/// A shared compute function over a whole batch.
pub type ComputeFn = dyn Fn(Batch) -> BatchFuture + Send + Sync;

/// Whether the handler is initialised for inline execution or for a
/// dispatcher process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupKind {
    Inline,
    Process,
}

/// Per-partition options passed to `init`; one entry per partition.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub index: usize,
    pub batch_keys: Vec<String>,
}

/// Context handed to `handle_batch`: the executing partition index and,
/// in hooks mode, an emitter the compute function can stream named
/// intermediate values through.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub partition: usize,
    pub hooks: Option<HookEmitter>,
}

impl PartitionContext {
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            hooks: None,
        }
    }

    pub fn with_hooks(partition: usize, hooks: HookEmitter) -> Self {
        Self {
            partition,
            hooks: Some(hooks),
        }
    }
}

/// The user handler contract.
pub trait BatchServing: Send + 'static {
    /// Called once before any batch runs. `partitions` has one entry per
    /// configured partition, each naming the allowed batch keys.
    fn init(&mut self, startup: StartupKind, partitions: &[PartitionOptions]) -> Result<()>;

    /// Turn a sealed batch into a thunk. The thunk runs on the partition
    /// in `ctx` and must produce `(output, metadata)` with one output item
    /// per input item.
    fn handle_batch(&mut self, batch: Batch, ctx: &PartitionContext) -> Result<BatchThunk>;
}

enum Compute {
    Single(Arc<ComputeFn>),
    Keyed(HashMap<String, Arc<ComputeFn>>),
}

/// Default handler wrapping plain compute functions.
///
/// The single form runs every batch through one function. The keyed form
/// dispatches on the batch key, covering dispatchers serving several
/// compute functions at once.
pub struct FnServing {
    compute: Compute,
}

impl FnServing {
    /// Wrap one async compute function.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(Batch) -> BatchFuture + Send + Sync + 'static,
    {
        Self {
            compute: Compute::Single(Arc::new(compute)),
        }
    }

    /// Wrap a synchronous item-wise function. The metadata every reply
    /// carries defaults to `"server_info"`.
    pub fn from_sync<F>(compute: F) -> Self
    where
        F: Fn(&[Value]) -> Vec<Value> + Send + Sync + 'static,
    {
        let compute = Arc::new(compute);
        Self::new(move |batch: Batch| {
            let compute = Arc::clone(&compute);
            Box::pin(async move {
                let output = compute(batch.items());
                Ok((output, Value::String("server_info".to_string())))
            })
        })
    }

    /// Start building the key-dispatching form.
    pub fn keyed() -> KeyedServingBuilder {
        KeyedServingBuilder {
            computes: HashMap::new(),
        }
    }

    fn compute_for(&self, key: &str) -> Result<Arc<ComputeFn>> {
        match &self.compute {
            Compute::Single(f) => Ok(Arc::clone(f)),
            Compute::Keyed(map) => map.get(key).cloned().ok_or_else(|| {
                BatchlineError::configuration(format!(
                    "no compute function registered for batch key '{key}'"
                ))
            }),
        }
    }
}

/// Builder for the key-dispatching [`FnServing`] form.
pub struct KeyedServingBuilder {
    computes: HashMap<String, Arc<ComputeFn>>,
}

impl KeyedServingBuilder {
    /// Register an async compute function for one batch key.
    pub fn on<F>(mut self, key: impl Into<String>, compute: F) -> Self
    where
        F: Fn(Batch) -> BatchFuture + Send + Sync + 'static,
    {
        self.computes.insert(key.into(), Arc::new(compute));
        self
    }

    /// Register a synchronous item-wise function for one batch key.
    pub fn on_sync<F>(self, key: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&[Value]) -> Vec<Value> + Send + Sync + 'static,
    {
        let compute = Arc::new(compute);
        self.on(key, move |batch: Batch| {
            let compute = Arc::clone(&compute);
            Box::pin(async move {
                let output = compute(batch.items());
                Ok((output, Value::String("server_info".to_string())))
            })
        })
    }

    pub fn build(self) -> FnServing {
        FnServing {
            compute: Compute::Keyed(self.computes),
        }
    }
}

impl BatchServing for FnServing {
    fn init(&mut self, _startup: StartupKind, partitions: &[PartitionOptions]) -> Result<()> {
        // The keyed form must cover every key a partition may receive.
        if let Compute::Keyed(map) = &self.compute {
            for options in partitions {
                for key in &options.batch_keys {
                    if !map.contains_key(key) {
                        return Err(BatchlineError::configuration(format!(
                            "partition {} accepts batch key '{key}' but no compute \
                             function is registered for it",
                            options.index
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_batch(&mut self, batch: Batch, _ctx: &PartitionContext) -> Result<BatchThunk> {
        let compute = self.compute_for(batch.key())?;
        Ok(Box::new(move || compute(batch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> PartitionContext {
        PartitionContext::new(0)
    }

    #[tokio::test]
    async fn test_from_sync_squares() {
        let mut serving = FnServing::from_sync(|items| {
            items
                .iter()
                .map(|v| json!(v.as_i64().unwrap() * v.as_i64().unwrap()))
                .collect()
        });
        serving
            .init(
                StartupKind::Inline,
                &[PartitionOptions {
                    index: 0,
                    batch_keys: vec!["default".to_string()],
                }],
            )
            .unwrap();

        let thunk = serving
            .handle_batch(Batch::stack(vec![json!(2), json!(3)]), &context())
            .unwrap();
        let (output, metadata) = thunk().await.unwrap();
        assert_eq!(output, vec![json!(4), json!(9)]);
        assert_eq!(metadata, json!("server_info"));
    }

    #[tokio::test]
    async fn test_keyed_dispatch() {
        let mut serving = FnServing::keyed()
            .on_sync("double", |items| {
                items.iter().map(|v| json!(v.as_i64().unwrap() * 2)).collect()
            })
            .on_sync("half", |items| {
                items.iter().map(|v| json!(v.as_f64().unwrap() / 2.0)).collect()
            })
            .build();
        serving
            .init(
                StartupKind::Process,
                &[PartitionOptions {
                    index: 0,
                    batch_keys: vec!["double".to_string(), "half".to_string()],
                }],
            )
            .unwrap();

        let thunk = serving
            .handle_batch(Batch::stack(vec![json!(3)]).with_key("double"), &context())
            .unwrap();
        let (output, _) = thunk().await.unwrap();
        assert_eq!(output, vec![json!(6)]);

        let thunk = serving
            .handle_batch(Batch::stack(vec![json!(3)]).with_key("half"), &context())
            .unwrap();
        let (output, _) = thunk().await.unwrap();
        assert_eq!(output, vec![json!(1.5)]);
    }

    #[test]
    fn test_keyed_init_rejects_uncovered_key() {
        let mut serving = FnServing::keyed()
            .on_sync("double", |items| items.to_vec())
            .build();
        let err = serving
            .init(
                StartupKind::Process,
                &[PartitionOptions {
                    index: 0,
                    batch_keys: vec!["double".to_string(), "half".to_string()],
                }],
            )
            .unwrap_err();
        assert!(matches!(err, BatchlineError::Configuration { .. }));
    }

    #[test]
    fn test_keyed_unknown_key_at_dispatch() {
        let mut serving = FnServing::keyed()
            .on_sync("double", |items| items.to_vec())
            .build();
        let result = serving.handle_batch(
            Batch::stack(vec![json!(1)]).with_key("triple"),
            &context(),
        );
        assert!(result.is_err());
    }
}
