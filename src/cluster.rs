//! # Cluster Dispatch
//!
//! When a dispatcher name is not registered locally, discovery returns
//! the records of dispatchers running elsewhere and one is picked
//! uniformly at random. A dead pick is re-selected at most three times;
//! exhaustion surfaces `noproc`. The serving's distributed hooks
//! transform the input before submission and each reply on the way back.
//!
//! Discovery is an abstract lookup so any membership mechanism conforms;
//! [`StaticMembership`] is the built-in list-backed implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::client::{run_with_record, run_with_record_proxied, ServingInput, ServingResponse};
use crate::error::{BatchlineError, DownReason, Result};
use crate::registry::{self, ServingRecord};

/// Maximum node re-selections before a dead cluster member is fatal.
const MAX_NODE_RETRIES: u32 = 3;

/// Resolves a dispatcher name to the records of cluster members serving
/// it. Zero results means the name is served nowhere.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn members(&self, name: &str) -> Vec<Arc<ServingRecord>>;
}

/// List-backed membership: members join and leave explicitly.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: RwLock<HashMap<String, Vec<Arc<ServingRecord>>>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dispatcher record under a cluster-wide name.
    pub fn join(&self, name: impl Into<String>, record: Arc<ServingRecord>) {
        self.members
            .write()
            .expect("membership lock poisoned")
            .entry(name.into())
            .or_default()
            .push(record);
    }

    pub fn leave(&self, name: &str) {
        self.members
            .write()
            .expect("membership lock poisoned")
            .remove(name);
    }
}

#[async_trait]
impl MembershipLookup for StaticMembership {
    async fn members(&self, name: &str) -> Vec<Arc<ServingRecord>> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

/// Client that falls back to cluster members when the name is not local.
#[derive(Clone)]
pub struct ClusterClient {
    membership: Arc<dyn MembershipLookup>,
}

impl ClusterClient {
    pub fn new(membership: Arc<dyn MembershipLookup>) -> Self {
        Self { membership }
    }

    /// Run against the local dispatcher if one is registered, otherwise
    /// against a randomly chosen cluster member.
    pub async fn run(
        &self,
        name: &str,
        input: impl Into<ServingInput>,
    ) -> Result<ServingResponse> {
        let input = input.into();
        if let Some(record) = registry::lookup(name) {
            return run_with_record(record, input).await;
        }

        let mut retries = 0u32;
        let mut input = Some(input);
        loop {
            let members = self.membership.members(name).await;
            if members.is_empty() {
                return Err(BatchlineError::dispatcher_not_found(name));
            }
            let chosen = {
                let index = rand::thread_rng().gen_range(0..members.len());
                Arc::clone(&members[index])
            };
            if chosen.commands.is_closed() {
                if retries >= MAX_NODE_RETRIES {
                    return Err(BatchlineError::batch_failed(DownReason::Noproc));
                }
                retries += 1;
                warn!(dispatcher = name, retries, "Chosen cluster member is gone, re-selecting");
                continue;
            }

            match input.take() {
                Some(ServingInput::Single(batch)) => {
                    match run_remote(chosen, ServingInput::Single(batch.clone())).await {
                        Err(err) if err.is_noproc() && retries < MAX_NODE_RETRIES => {
                            retries += 1;
                            warn!(
                                dispatcher = name,
                                retries,
                                "Cluster member went away mid-submission, re-selecting"
                            );
                            input = Some(ServingInput::Single(batch));
                        }
                        other => return other,
                    }
                }
                // A partially consumed stream cannot be replayed, so only
                // node selection is retried for stream input.
                Some(stream_input) => return run_remote(chosen, stream_input).await,
                None => return Err(BatchlineError::internal("cluster input already consumed")),
            }
        }
    }
}

async fn run_remote(record: Arc<ServingRecord>, input: ServingInput) -> Result<ServingResponse> {
    let hooks = record.hooks.clone();
    let input = match &hooks.distributed_preprocessing {
        Some(pre) => pre(input)?,
        None => input,
    };
    match &hooks.distributed_postprocessing {
        Some(transform) => run_with_record_proxied(record, input, Arc::clone(transform)).await,
        None => run_with_record(record, input).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::command_channel;
    use crate::client::ClientHooks;
    use crate::config::ServingOptions;

    fn dead_record(name: &str) -> Arc<ServingRecord> {
        let (commands, rx) = command_channel(1);
        drop(rx);
        Arc::new(ServingRecord::new(
            &ServingOptions::new(name),
            ClientHooks::default(),
            commands,
        ))
    }

    #[tokio::test]
    async fn test_no_members_is_dispatcher_not_found() {
        let client = ClusterClient::new(Arc::new(StaticMembership::new()));
        let err = client
            .run(
                "cluster-test-nowhere",
                crate::batch::Batch::stack(vec![serde_json::json!(1)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchlineError::DispatcherNotFound { .. }));
    }

    #[tokio::test]
    async fn test_dead_members_exhaust_retries_with_noproc() {
        let membership = Arc::new(StaticMembership::new());
        membership.join("cluster-test-dead", dead_record("cluster-test-dead"));
        let client = ClusterClient::new(Arc::clone(&membership) as Arc<dyn MembershipLookup>);

        let err = client
            .run(
                "cluster-test-dead",
                crate::batch::Batch::stack(vec![serde_json::json!(1)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchlineError::BatchFailed {
                reason: DownReason::Noproc
            }
        ));
    }
}
