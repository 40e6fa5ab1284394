//! Line Function Registry
//!
//! Maps function names to closures that run on a line's owner. INVOKE ships only the
//! name and an argument blob, so every node that may own the line registers the same
//! functions at startup.

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// What a line function produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeOutcome {
    /// New payload for the line; `None` leaves the line untouched.
    pub update: Option<Bytes>,
    /// Value handed back to the caller.
    pub result: Option<Bytes>,
}

/// A function run against the current payload with the caller's arguments.
pub type LineFunctionFn = Arc<dyn Fn(Option<&Bytes>, &Bytes) -> Result<InvokeOutcome> + Send + Sync>;

pub struct InvokeRegistry {
    functions: DashMap<String, LineFunctionFn>,
}

impl InvokeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F>(&self, name: &str, function: F)
    where
        F: Fn(Option<&Bytes>, &Bytes) -> Result<InvokeOutcome> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        tracing::info!("Registered line function: {}", name);
    }

    /// Runs `name` against `data`. Fails when the function is unknown on this node.
    pub fn invoke(&self, name: &str, data: Option<&Bytes>, args: &Bytes) -> Result<InvokeOutcome> {
        // Clone out of the map so the shard lock is not held while user code runs.
        let function = match self.functions.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                let error = format!("Unknown line function: {}", name);
                tracing::error!("{}", error);
                return Err(anyhow::anyhow!(error));
            }
        };

        tracing::debug!(
            "Invoking '{}' (payload {} bytes, args {} bytes)",
            name,
            data.map(|d| d.len()).unwrap_or(0),
            args.len()
        );
        function(data, args)
    }
}

impl Default for InvokeRegistry {
    fn default() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }
}
