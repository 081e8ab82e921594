use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use loglens_core::error::Result;
use loglens_core::traits::KnowledgeIndex;

use crate::graph::state::{keys, Delta, SharedState};
use crate::graph::{Capability, Worker};

/// Looks up prior analyses of the same kind of log.
pub struct SearchWorker {
    name: String,
    index: Arc<dyn KnowledgeIndex>,
    limit: usize,
}

impl SearchWorker {
    pub fn new(name: impl Into<String>, index: Arc<dyn KnowledgeIndex>) -> Self {
        Self {
            name: name.into(),
            index,
            limit: 5,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl Worker for SearchWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Search
    }

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        Box::pin(async move {
            let request = state.request();
            let hits = self
                .index
                .search(request.log_type.as_str(), self.limit)
                .await?;
            // Prefer history of the same machine when the job names one.
            let mut hits = hits;
            if let Some(computer_id) = request.computer_id {
                hits.sort_by_key(|h| h.computer_id != computer_id);
            }
            debug!(node = %self.name, hits = hits.len(), "Knowledge search done");

            let content = if hits.is_empty() {
                format!("No prior {} analyses found", request.log_type)
            } else {
                format!("Found {} prior {} analyses", hits.len(), request.log_type)
            };
            Ok(Delta::complete(&self.name, content)
                .with_artifact(keys::RELATED, serde_json::to_value(&hits)?))
        })
    }
}
