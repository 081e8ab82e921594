use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info};

use loglens_core::error::Result;
use loglens_core::traits::Reasoner;
use loglens_core::types::LogType;

use crate::graph::state::{keys, Delta, SharedState};
use crate::graph::{Capability, Worker};

const PREFETCH_PROMPT: &str = "You are a digital forensics analyst. The records are Windows prefetch \
entries. Report the 10 most frequently executed applications with their run counts and last run \
times, and flag anything unusual such as tools commonly used by attackers or programs run from \
temporary directories. Answer in plain text.";

const EVENT_LOG_PROMPT: &str = "You are a digital forensics analyst. The records are Windows event \
log entries. Report the number of events, the time span they cover, a breakdown by level \
(Information, Warning, Error), the most frequent event IDs and sources, and any anomalies worth \
investigating. Answer in plain text.";

/// Turns collected records into a written forensic summary.
pub struct AnalysisWorker {
    name: String,
    reasoner: Arc<dyn Reasoner>,
    min_chars: usize,
    max_records: usize,
}

impl AnalysisWorker {
    pub fn new(name: impl Into<String>, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            name: name.into(),
            reasoner,
            min_chars: 40,
            max_records: 500,
        }
    }

    /// Results shorter than this are reported incomplete.
    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = min_chars;
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    fn build_context(&self, log_type: LogType, records: &[Value], related: Option<&Value>) -> String {
        let shown = &records[..records.len().min(self.max_records)];
        let mut context = format!(
            "Log type: {}\nRecords: {} (showing {})\n\nPrecomputed statistics:\n{}\n",
            log_type,
            records.len(),
            shown.len(),
            log_stats(log_type, records),
        );
        if let Some(related) = related.filter(|r| r.as_array().is_some_and(|a| !a.is_empty())) {
            context.push_str(&format!("\nPrior analyses of similar logs:\n{}\n", related));
        }
        context.push_str(&format!(
            "\nRecords:\n{}",
            serde_json::to_string(shown).unwrap_or_default()
        ));
        context
    }
}

impl Worker for AnalysisWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Analysis
    }

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        Box::pin(async move {
            let request = state.request();
            let records: Vec<Value> = match state.artifacts().get(keys::LOGS) {
                Some(Value::Array(records)) => records.clone(),
                _ => request.logs.clone().unwrap_or_default(),
            };
            if records.is_empty() {
                return Ok(Delta::failed(&self.name, "No collected logs to analyze"));
            }

            let prompt = if request.log_type.is_prefetch() {
                PREFETCH_PROMPT
            } else {
                EVENT_LOG_PROMPT
            };
            let context =
                self.build_context(request.log_type, &records, state.artifacts().get(keys::RELATED));
            debug!(node = %self.name, records = records.len(), context_len = context.len(), "Requesting analysis");

            let text = self.reasoner.reason(prompt, &context).await?;
            let text = text.trim().to_string();
            if text.chars().count() < self.min_chars {
                return Ok(Delta::incomplete(
                    &self.name,
                    format!("Analysis too short ({} chars): {}", text.chars().count(), text),
                ));
            }

            info!(node = %self.name, chars = text.len(), "Analysis complete");
            Ok(Delta::complete(&self.name, text.clone())
                .with_analysis(text.clone())
                .with_artifact(keys::SUMMARY, Value::String(text)))
        })
    }
}

/// Deterministic counts handed to the reasoner alongside the raw records.
///
/// Prefetch: top 10 executables by run count. Event logs: totals per level,
/// per event ID (top 10) and the first/last timestamps seen.
pub fn log_stats(log_type: LogType, records: &[Value]) -> Value {
    if log_type.is_prefetch() {
        let mut runs: BTreeMap<String, u64> = BTreeMap::new();
        for r in records {
            let Some(exe) = field_str(r, &["ExecutableName", "executable", "exe", "Name"]) else {
                continue;
            };
            let count = field(r, &["RunCount", "run_count", "runs"])
                .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(1);
            *runs.entry(exe.to_string()).or_default() += count;
        }
        let mut top: Vec<(String, u64)> = runs.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);
        let top: Vec<Value> = top
            .into_iter()
            .map(|(exe, runs)| json!({ "executable": exe, "runs": runs }))
            .collect();
        return json!({ "records": records.len(), "top_applications": top });
    }

    let mut levels: BTreeMap<String, usize> = BTreeMap::new();
    let mut ids: BTreeMap<String, usize> = BTreeMap::new();
    let mut times: Vec<&str> = Vec::new();
    for r in records {
        if let Some(level) = field_str(r, &["LevelDisplayName", "Level", "level"]) {
            *levels.entry(level.to_string()).or_default() += 1;
        }
        if let Some(id) = field(r, &["EventID", "Id", "event_id"]) {
            let id = id.as_str().map(String::from).unwrap_or_else(|| id.to_string());
            *ids.entry(id).or_default() += 1;
        }
        if let Some(t) = field_str(r, &["TimeCreated", "TimeGenerated", "timestamp"]) {
            times.push(t);
        }
    }
    times.sort_unstable();
    let mut top_ids: Vec<(String, usize)> = ids.into_iter().collect();
    top_ids.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_ids.truncate(10);

    json!({
        "records": records.len(),
        "levels": levels,
        "top_event_ids": top_ids
            .into_iter()
            .map(|(id, count)| json!({ "event_id": id, "count": count }))
            .collect::<Vec<_>>(),
        "first_seen": times.first(),
        "last_seen": times.last(),
    })
}

fn field<'a>(record: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| record.get(*n))
}

fn field_str<'a>(record: &'a Value, names: &[&str]) -> Option<&'a str> {
    field(record, names).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::state::JobRequest;
    use crate::graph::Outcome;
    use loglens_core::types::{JobId, JobPayload};

    struct Canned(&'static str);

    impl Reasoner for Canned {
        fn reason(&self, _prompt: &str, _context: &str) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    fn state(log_type: LogType, logs: Vec<Value>) -> SharedState {
        SharedState::new(JobRequest::from_payload(
            JobId::from_string("j"),
            JobPayload::inline(log_type, logs),
        ))
    }

    #[test]
    fn test_prefetch_top_applications() {
        let records = vec![
            json!({"ExecutableName": "CMD.EXE", "RunCount": 4}),
            json!({"ExecutableName": "CHROME.EXE", "RunCount": 12}),
            json!({"ExecutableName": "CMD.EXE", "RunCount": "3"}),
            json!({"unrelated": true}),
        ];
        let stats = log_stats(LogType::Prefetch, &records);
        assert_eq!(stats["top_applications"][0]["executable"], "CHROME.EXE");
        assert_eq!(stats["top_applications"][1]["runs"], 7);
    }

    #[test]
    fn test_event_levels_and_span() {
        let records = vec![
            json!({"LevelDisplayName": "Error", "EventID": 7000, "TimeCreated": "2024-11-18T10:00:00Z"}),
            json!({"LevelDisplayName": "Information", "EventID": 7036, "TimeCreated": "2024-11-18T09:00:00Z"}),
            json!({"LevelDisplayName": "Error", "EventID": 7000, "TimeCreated": "2024-11-18T11:00:00Z"}),
        ];
        let stats = log_stats(LogType::System, &records);
        assert_eq!(stats["levels"]["Error"], 2);
        assert_eq!(stats["top_event_ids"][0]["event_id"], "7000");
        assert_eq!(stats["first_seen"], "2024-11-18T09:00:00Z");
        assert_eq!(stats["last_seen"], "2024-11-18T11:00:00Z");
    }

    #[tokio::test]
    async fn test_short_answer_incomplete() {
        let w = AnalysisWorker::new("analysis", Arc::new(Canned("ok")));
        let delta = w
            .invoke(&state(LogType::System, vec![json!({"EventID": 1})]))
            .await
            .unwrap();
        assert_eq!(delta.outcome, Outcome::Incomplete);
        assert!(delta.analysis_result.is_none());
    }

    #[tokio::test]
    async fn test_full_answer_sets_summary() {
        let text = "Two service control manager errors (7000) between 09:00 and 11:00 UTC.";
        let w = AnalysisWorker::new("analysis", Arc::new(Canned(text)));
        let delta = w
            .invoke(&state(LogType::System, vec![json!({"EventID": 7000})]))
            .await
            .unwrap();
        assert_eq!(delta.outcome, Outcome::Complete);
        assert_eq!(delta.analysis_result.as_deref(), Some(text));
        assert_eq!(delta.artifacts[0].0, keys::SUMMARY);
    }

    #[tokio::test]
    async fn test_no_records_fails() {
        let w = AnalysisWorker::new("analysis", Arc::new(Canned("irrelevant")));
        let delta = w.invoke(&state(LogType::System, vec![])).await.unwrap();
        assert_eq!(delta.outcome, Outcome::Failed);
    }
}
