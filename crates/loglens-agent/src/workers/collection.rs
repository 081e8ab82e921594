use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::LogSource;

use crate::graph::state::{keys, Delta, JobRequest, SharedState};
use crate::graph::{Capability, Worker};

/// Which artifacts a collector handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Prefetch files.
    Prefetch,
    /// Windows event logs of any channel.
    EventLog,
}

/// Gathers the raw records a job analyzes.
///
/// Inline records on the request win; otherwise the selector is resolved
/// through the log source.
pub struct CollectionWorker {
    name: String,
    kind: CollectionKind,
    source: Option<Arc<dyn LogSource>>,
}

impl CollectionWorker {
    pub fn new(name: impl Into<String>, kind: CollectionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn LogSource>) -> Self {
        self.source = Some(source);
        self
    }

    async fn collect(&self, request: &JobRequest) -> Result<Option<Vec<serde_json::Value>>> {
        if let Some(ref logs) = request.logs {
            debug!(node = %self.name, records = logs.len(), "Using inline records");
            return Ok(Some(logs.clone()));
        }
        let Some(ref selector) = request.selector else {
            return Ok(None);
        };
        let source = self.source.as_ref().ok_or_else(|| {
            LoglensError::LogSource("no log source configured for selector-based jobs".into())
        })?;
        let bundle = source.fetch_logs(selector).await?;
        Ok(Some(bundle.records))
    }
}

impl Worker for CollectionWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Collection
    }

    fn accepts(&self, request: &JobRequest) -> bool {
        match self.kind {
            CollectionKind::Prefetch => request.log_type.is_prefetch(),
            CollectionKind::EventLog => !request.log_type.is_prefetch(),
        }
    }

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        Box::pin(async move {
            let request = state.request();
            if !self.accepts(request) {
                return Ok(Delta::failed(
                    &self.name,
                    format!("{} cannot collect {} logs", self.name, request.log_type),
                ));
            }

            let Some(records) = self.collect(request).await? else {
                return Ok(Delta::failed(
                    &self.name,
                    "The job carries neither inline logs nor a log selector",
                ));
            };

            if records.is_empty() {
                return Ok(Delta::incomplete(
                    &self.name,
                    format!("No {} records found", request.log_type),
                ));
            }

            info!(node = %self.name, records = records.len(), log_type = %request.log_type, "Logs collected");
            Ok(Delta::complete(
                &self.name,
                format!("Collected {} {} records", records.len(), request.log_type),
            )
            .with_artifact(keys::LOGS, serde_json::Value::Array(records)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use loglens_core::types::{JobId, JobPayload, LogBundle, LogSelector, LogType};
    use serde_json::json;

    struct OneRecord;

    impl LogSource for OneRecord {
        fn fetch_logs(&self, selector: &LogSelector) -> BoxFuture<'_, Result<LogBundle>> {
            let id = selector.computer_id;
            Box::pin(async move { Ok(LogBundle::new(vec![json!({"EventID": 4625, "computer": id})])) })
        }
    }

    fn state(payload: JobPayload) -> SharedState {
        SharedState::new(JobRequest::from_payload(JobId::from_string("j"), payload))
    }

    fn selector() -> LogSelector {
        LogSelector {
            computer_id: 3,
            user_id: 1,
            log_type: LogType::Security,
            start: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 11, 2, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_inline_records() {
        let w = CollectionWorker::new("prefetch", CollectionKind::Prefetch);
        let s = state(JobPayload::inline(LogType::Prefetch, vec![json!({"exe": "A"}), json!({"exe": "B"})]));
        let delta = w.invoke(&s).await.unwrap();
        assert_eq!(delta.outcome, crate::graph::Outcome::Complete);
        assert_eq!(delta.artifacts[0].0, keys::LOGS);
        assert_eq!(delta.artifacts[0].1.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_selector_uses_source() {
        let w = CollectionWorker::new("events", CollectionKind::EventLog).with_source(Arc::new(OneRecord));
        let delta = w.invoke(&state(JobPayload::staged(selector()))).await.unwrap();
        assert!(delta.messages[0].contains("Collected 1 security records"));
    }

    #[tokio::test]
    async fn test_selector_without_source_errors() {
        let w = CollectionWorker::new("events", CollectionKind::EventLog);
        assert!(w.invoke(&state(JobPayload::staged(selector()))).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_bundle_incomplete() {
        let w = CollectionWorker::new("events", CollectionKind::EventLog);
        let delta = w
            .invoke(&state(JobPayload::inline(LogType::System, vec![])))
            .await
            .unwrap();
        assert_eq!(delta.outcome, crate::graph::Outcome::Incomplete);
        assert!(delta.artifacts.is_empty());
    }

    #[test]
    fn test_accepts_by_log_type() {
        let prefetch = CollectionWorker::new("p", CollectionKind::Prefetch);
        let events = CollectionWorker::new("e", CollectionKind::EventLog);
        let req = JobRequest::from_payload(JobId::new(), JobPayload::inline(LogType::Setup, vec![]));
        assert!(!prefetch.accepts(&req));
        assert!(events.accepts(&req));
    }
}
