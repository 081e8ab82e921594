use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::{LogSource, ObjectStore};
use loglens_core::types::{LogBundle, LogSelector};

/// Log source reading bundles that collectors staged in the object store
/// under [`LogSelector::staged_key`].
pub struct StagedLogSource {
    objects: Arc<dyn ObjectStore>,
}

impl StagedLogSource {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Stage a bundle for later collection. Returns the object URL.
    pub async fn stage(&self, selector: &LogSelector, bundle: &LogBundle) -> Result<String> {
        let bytes = serde_json::to_vec(&bundle.records)?;
        self.objects.store(&selector.staged_key(), bytes).await
    }
}

impl LogSource for StagedLogSource {
    fn fetch_logs(&self, selector: &LogSelector) -> BoxFuture<'_, Result<LogBundle>> {
        let key = selector.staged_key();
        Box::pin(async move {
            let bytes = match self.objects.retrieve(&key).await {
                Ok(bytes) => bytes,
                Err(LoglensError::NotFound(_)) => {
                    return Err(LoglensError::NotFound(format!("no logs staged at {}", key)))
                }
                Err(e) => return Err(e),
            };
            let records: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
                .map_err(|e| LoglensError::LogSource(format!("{}: {}", key, e)))?;
            debug!(%key, records = records.len(), "Staged logs loaded");
            Ok(LogBundle::new(records))
        })
    }
}
