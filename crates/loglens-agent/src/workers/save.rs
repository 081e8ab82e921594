use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use loglens_core::error::Result;
use loglens_core::traits::ObjectStore;

use crate::graph::state::{keys, Delta, SharedState};
use crate::graph::{Capability, Worker};

/// Persists the collected bundle to the object store.
pub struct SaveWorker {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl SaveWorker {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

impl Worker for SaveWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Persistence
    }

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        Box::pin(async move {
            let Some(logs) = state.artifacts().get(keys::LOGS) else {
                return Ok(Delta::failed(&self.name, "Nothing has been collected yet"));
            };
            let request = state.request();
            let key = format!("logs/{}/{}.json", request.job_id, request.log_type);
            let bytes = serde_json::to_vec(logs)?;
            let size = bytes.len();
            let url = self.store.store(&key, bytes).await?;

            info!(node = %self.name, %key, size, "Log bundle saved");
            let count = logs.as_array().map(Vec::len).unwrap_or(0);
            Ok(
                Delta::complete(&self.name, format!("Saved {} records to {}", count, url))
                    .with_artifact(keys::LOG_URL, serde_json::Value::String(url)),
            )
        })
    }
}
