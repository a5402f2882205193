//! # Dispatcher Registry
//!
//! Process-wide store of per-dispatcher records keyed by name. Clients
//! resolve the batch limit, mode, allowed keys and client hooks from here
//! without a dispatcher round-trip; the dispatcher registers at startup
//! and deregisters on termination.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use crate::client::ClientHooks;
use crate::config::{ServingMode, ServingOptions};
use crate::error::{BatchlineError, Result};
use crate::messages::CommandSender;

/// Persisted record for one named dispatcher.
#[derive(Clone)]
pub struct ServingRecord {
    pub name: String,
    pub limit: usize,
    pub mode: ServingMode,
    pub batch_keys: HashSet<String>,
    pub hooks: ClientHooks,
    pub commands: CommandSender,
}

impl ServingRecord {
    pub fn new(options: &ServingOptions, hooks: ClientHooks, commands: CommandSender) -> Self {
        Self {
            name: options.name.clone(),
            limit: options.batch_size,
            mode: options.mode,
            batch_keys: options.batch_keys.iter().cloned().collect(),
            hooks,
            commands,
        }
    }
}

impl std::fmt::Debug for ServingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingRecord")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("mode", &self.mode)
            .field("batch_keys", &self.batch_keys)
            .finish_non_exhaustive()
    }
}

type Registry = RwLock<HashMap<String, Arc<ServingRecord>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a dispatcher record. Names are globally unique within the
/// process; collisions are configuration errors.
pub(crate) fn register(record: Arc<ServingRecord>) -> Result<()> {
    let mut map = registry().write().expect("dispatcher registry poisoned");
    if map.contains_key(&record.name) {
        return Err(BatchlineError::configuration(format!(
            "a dispatcher named '{}' is already running",
            record.name
        )));
    }
    map.insert(record.name.clone(), record);
    Ok(())
}

pub(crate) fn deregister(name: &str) {
    registry()
        .write()
        .expect("dispatcher registry poisoned")
        .remove(name);
}

/// Look up a dispatcher record by name.
pub fn lookup(name: &str) -> Option<Arc<ServingRecord>> {
    registry()
        .read()
        .expect("dispatcher registry poisoned")
        .get(name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::command_channel;

    fn record(name: &str) -> Arc<ServingRecord> {
        let (commands, _rx) = command_channel(1);
        Arc::new(ServingRecord::new(
            &ServingOptions::new(name),
            ClientHooks::default(),
            commands,
        ))
    }

    #[test]
    fn test_register_lookup_deregister() {
        let name = "registry-test-lifecycle";
        register(record(name)).unwrap();
        let found = lookup(name).unwrap();
        assert_eq!(found.limit, 1);
        assert!(found.batch_keys.contains("default"));

        deregister(name);
        assert!(lookup(name).is_none());
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let name = "registry-test-duplicate";
        register(record(name)).unwrap();
        let err = register(record(name)).unwrap_err();
        assert!(matches!(err, BatchlineError::Configuration { .. }));
        deregister(name);
    }
}
