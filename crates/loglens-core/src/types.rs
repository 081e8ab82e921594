use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability class of a worker node.
///
/// Declaration order is the order in which the rule checklist visits classes.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Collection,
    Persistence,
    Search,
    Analysis,
    Visualization,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Persistence => "persistence",
            Self::Analysis => "analysis",
            Self::Visualization => "visualization",
            Self::Search => "search",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node's contribution turned out.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    /// Output present but judged not good enough; the supervisor may re-invoke.
    Incomplete,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
        }
    }
}

/// Kind of Windows artifact being analyzed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    #[serde(alias = "Prefetch")]
    Prefetch,
    #[serde(alias = "Application")]
    Application,
    #[serde(alias = "Security")]
    Security,
    #[serde(alias = "Forwarded")]
    Forwarded,
    #[serde(alias = "Setup")]
    Setup,
    #[serde(alias = "System")]
    System,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefetch => "prefetch",
            Self::Application => "application",
            Self::Security => "security",
            Self::Forwarded => "forwarded",
            Self::Setup => "setup",
            Self::System => "system",
        }
    }

    /// Case-insensitive parse.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "prefetch" => Some(Self::Prefetch),
            "application" => Some(Self::Application),
            "security" => Some(Self::Security),
            "forwarded" => Some(Self::Forwarded),
            "setup" => Some(Self::Setup),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Prefetch files are collected separately from Windows event logs.
    pub fn is_prefetch(&self) -> bool {
        matches!(self, Self::Prefetch)
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one collected log bundle: machine + log type + time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSelector {
    pub computer_id: i64,
    pub user_id: i64,
    pub log_type: LogType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LogSelector {
    /// Object-store key under which the bundle is staged.
    pub fn staged_key(&self) -> String {
        format!(
            "staged/{}/{}_{}_{}_{}.json",
            self.log_type.as_str(),
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d"),
            self.user_id,
            self.computer_id,
        )
    }
}

/// A batch of raw log records of one type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBundle {
    pub records: Vec<serde_json::Value>,
}

impl LogBundle {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What a caller submits to start a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub log_type: LogType,
    /// Inline records; when absent the collection worker fetches them.
    #[serde(default)]
    pub logs: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub selector: Option<LogSelector>,
    #[serde(default)]
    pub computer_id: Option<i64>,
}

impl JobPayload {
    pub fn inline(log_type: LogType, logs: Vec<serde_json::Value>) -> Self {
        Self {
            log_type,
            logs: Some(logs),
            selector: None,
            computer_id: None,
        }
    }

    pub fn staged(selector: LogSelector) -> Self {
        Self {
            log_type: selector.log_type,
            logs: None,
            computer_id: Some(selector.computer_id),
            selector: Some(selector),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Whatever a failed run had accumulated, for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub messages: usize,
    /// Human-readable account of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The caller-facing result of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialArtifacts>,
}

impl JobResult {
    pub fn completed(job_id: JobId, summary: String, images: Vec<String>) -> Self {
        Self {
            job_id,
            summary: Some(summary),
            images,
            status: JobStatus::Completed,
            failure_reason: None,
            partial: None,
        }
    }

    pub fn failed(job_id: JobId, reason: impl Into<String>, partial: PartialArtifacts) -> Self {
        Self {
            job_id,
            summary: None,
            images: vec![],
            status: JobStatus::Failed,
            failure_reason: Some(reason.into()),
            partial: Some(partial),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// A prior analysis surfaced by the knowledge index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub task_id: i64,
    pub computer_id: i64,
    pub task_type: String,
    pub snippet: String,
    pub created_at: DateTime<Utc>,
    pub rank: f64,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted { job_id: JobId },
    NodeStarted { job_id: JobId, node: String, step: usize },
    NodeFinished {
        job_id: JobId,
        node: String,
        step: usize,
        outcome: Outcome,
        elapsed_ms: u64,
    },
    /// The supervisor settled on a route. `proposed` differs from `decided` when a guard corrected it.
    Decision {
        job_id: JobId,
        proposed: String,
        decided: String,
    },
    /// A merge discarded part of a delta.
    MergeAnomaly { job_id: JobId, node: String, detail: String },
    RunFinished {
        job_id: JobId,
        status: String,
        reason: Option<String>,
        steps: usize,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::RunStarted { job_id }
            | Self::NodeStarted { job_id, .. }
            | Self::NodeFinished { job_id, .. }
            | Self::Decision { job_id, .. }
            | Self::MergeAnomaly { job_id, .. }
            | Self::RunFinished { job_id, .. } => job_id,
        }
    }
}
