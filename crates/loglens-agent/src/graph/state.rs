use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use loglens_core::types::{JobId, JobPayload, LogSelector, LogType};

pub use loglens_core::types::Outcome;

/// Author of the seed message.
pub const USER: &str = "user";

/// Well-known artifact keys.
pub mod keys {
    pub const SUMMARY: &str = "summary";
    pub const IMAGES: &str = "images";
    pub const LOGS: &str = "logs";
    pub const LOG_URL: &str = "log_url";
    pub const RELATED: &str = "related";
}

/// One entry in the shared conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    pub content: String,
    pub outcome: Outcome,
    /// Index of the merge that appended this message. 0 is the seed.
    pub turn: usize,
}

/// Set-once artifact map, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts(BTreeMap<String, serde_json::Value>);

impl Artifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key` unless the key is already present.
    /// Returns whether the value was stored.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> bool {
        match self.0.entry(key.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Present and carrying something: not null, not an empty string, array or object.
    pub fn is_filled(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        self.get(keys::SUMMARY).and_then(|v| v.as_str())
    }

    pub fn images(&self) -> Vec<String> {
        self.get(keys::IMAGES)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The immutable job request a run starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub log_type: LogType,
    pub logs: Option<Vec<serde_json::Value>>,
    pub selector: Option<LogSelector>,
    pub computer_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl JobRequest {
    pub fn from_payload(job_id: JobId, payload: JobPayload) -> Self {
        let user_id = payload.selector.as_ref().map(|s| s.user_id);
        Self {
            job_id,
            log_type: payload.log_type,
            logs: payload.logs,
            selector: payload.selector,
            computer_id: payload.computer_id,
            user_id,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Text of the seed message.
    pub fn describe(&self) -> String {
        let mut text = format!("Analyze the {} logs for job {}", self.log_type, self.job_id);
        if let Some(ref logs) = self.logs {
            text.push_str(&format!(" ({} records supplied inline)", logs.len()));
        } else if let Some(ref sel) = self.selector {
            text.push_str(&format!(
                " (computer {}, {} to {})",
                sel.computer_id,
                sel.start.format("%Y-%m-%d"),
                sel.end.format("%Y-%m-%d"),
            ));
        }
        text.push('.');
        text
    }
}

/// Incremental change a node contributes to the shared state.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub author: String,
    pub outcome: Outcome,
    pub messages: Vec<String>,
    pub analysis_result: Option<String>,
    pub artifacts: Vec<(String, serde_json::Value)>,
}

impl Delta {
    fn new(author: impl Into<String>, outcome: Outcome, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            outcome,
            messages: vec![content.into()],
            analysis_result: None,
            artifacts: vec![],
        }
    }

    pub fn complete(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(author, Outcome::Complete, content)
    }

    /// Output present but not good enough yet.
    pub fn incomplete(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(author, Outcome::Incomplete, content)
    }

    /// The message content should say what went wrong.
    pub fn failed(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(author, Outcome::Failed, content)
    }

    pub fn with_message(mut self, content: impl Into<String>) -> Self {
        self.messages.push(content.into());
        self
    }

    pub fn with_analysis(mut self, text: impl Into<String>) -> Self {
        self.analysis_result = Some(text.into());
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.artifacts.push((key.into(), value));
        self
    }

    /// Re-tag the delta with the node that actually produced it.
    pub(crate) fn authored_by(mut self, author: &str) -> Self {
        if self.author != author {
            self.author = author.to_string();
        }
        self
    }
}

/// A non-fatal problem found while merging a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeAnomaly {
    /// A delta that was not complete tried to write results; they were dropped.
    DroppedPartial { author: String },
    /// A set-once artifact key was already populated.
    ArtifactOverwrite { author: String, key: String },
    /// The analysis result was already set.
    AnalysisOverwrite { author: String },
}

impl std::fmt::Display for MergeAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DroppedPartial { author } => {
                write!(f, "dropped results from non-complete delta by {}", author)
            }
            Self::ArtifactOverwrite { author, key } => {
                write!(f, "{} tried to overwrite artifact '{}'", author, key)
            }
            Self::AnalysisOverwrite { author } => {
                write!(f, "{} tried to overwrite the analysis result", author)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub appended: usize,
    pub anomalies: Vec<MergeAnomaly>,
}

/// The single record threaded through a job's execution.
///
/// Only the engine mutates it: through [`SharedState::merge`] and [`SharedState::set_next`].
/// Workers receive it by shared reference.
#[derive(Debug, Clone, Serialize)]
pub struct SharedState {
    request: JobRequest,
    messages: Vec<Message>,
    next: Option<String>,
    analysis_result: Option<String>,
    artifacts: Artifacts,
    turns: usize,
}

impl SharedState {
    pub fn new(request: JobRequest) -> Self {
        let seed = Message {
            author: USER.to_string(),
            content: request.describe(),
            outcome: Outcome::Complete,
            turn: 0,
        };
        Self {
            request,
            messages: vec![seed],
            next: None,
            analysis_result: None,
            artifacts: Artifacts::new(),
            turns: 0,
        }
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn analysis_result(&self) -> Option<&str> {
        self.analysis_result.as_deref()
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// Messages written by `author`, oldest first.
    pub fn messages_by<'a>(&'a self, author: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.iter().filter(move |m| m.author == author)
    }

    /// Fold a delta into the state.
    ///
    /// Messages are always appended. Results from a delta that is not
    /// `Complete` are discarded. Artifacts are set-once and the analysis
    /// result is written at most once; later writes are discarded and
    /// reported as anomalies.
    pub fn merge(&mut self, delta: Delta) -> MergeReport {
        let mut report = MergeReport::default();
        self.turns += 1;
        let turn = self.turns;

        for content in delta.messages {
            self.messages.push(Message {
                author: delta.author.clone(),
                content,
                outcome: delta.outcome,
                turn,
            });
            report.appended += 1;
        }

        if delta.outcome != Outcome::Complete {
            if delta.analysis_result.is_some() || !delta.artifacts.is_empty() {
                report.anomalies.push(MergeAnomaly::DroppedPartial {
                    author: delta.author.clone(),
                });
            }
        } else {
            if let Some(text) = delta.analysis_result {
                if self.analysis_result.is_none() {
                    self.analysis_result = Some(text);
                } else {
                    report.anomalies.push(MergeAnomaly::AnalysisOverwrite {
                        author: delta.author.clone(),
                    });
                }
            }
            for (key, value) in delta.artifacts {
                if !self.artifacts.insert(key.clone(), value) {
                    report.anomalies.push(MergeAnomaly::ArtifactOverwrite {
                        author: delta.author.clone(),
                        key,
                    });
                }
            }
        }

        for anomaly in &report.anomalies {
            warn!(job_id = %self.request.job_id, %anomaly, "Merge anomaly, later write discarded");
        }
        report
    }

    pub(crate) fn set_next(&mut self, next: impl Into<String>) {
        self.next = Some(next.into());
    }
}
