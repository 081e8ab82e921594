//! Shared test utilities, mocks, and fixtures for loglens crates.
//!
//! Every collaborator trait has an in-memory stand-in here, plus a
//! [`ScriptedPolicy`] for driving the supervisor deterministically and a
//! [`ScriptedWorker`] for graphs that do not need the real forensic workers.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use loglens_agent::graph::{Capability, DecisionContext, DecisionPolicy, Delta, SharedState, Worker};
use loglens_core::config::AppConfig;
use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::{KnowledgeIndex, LogSource, ObjectStore, Reasoner};
use loglens_core::types::{LogBundle, LogSelector, LogType, SearchHit};

/// Prompt fragments that identify who is asking the reasoner.
pub mod prompts {
    pub const SUPERVISOR: &str = "You supervise";
    pub const ANALYSIS: &str = "digital forensics analyst";
    pub const CHARTS: &str = "bar charts";
}

/// A canned forensic summary long enough to count as complete.
pub const ANALYSIS_TEXT: &str = "Between 09:00 and 11:00 UTC the Service Control Manager logged two \
errors (event 7000) for a service that failed to start; the remaining entries are routine.";

/// A chart response with a single usable chart.
pub const CHARTS_JSON: &str = r#"{"charts": [{"title": "Events by level", "labels": ["Error", "Information"], "values": [2, 1]}]}"#;

// ---------------------------------------------------------------------------
// Reasoner
// ---------------------------------------------------------------------------

struct Rule {
    needle: String,
    replies: VecDeque<String>,
}

/// Reasoner answering by prompt substring. Each rule replays its replies in
/// order and keeps repeating the last one.
#[derive(Default)]
pub struct ScriptedReasoner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analysis and chart prompts answered with [`ANALYSIS_TEXT`] and [`CHARTS_JSON`].
    pub fn forensic() -> Self {
        Self::new()
            .when(prompts::ANALYSIS, ANALYSIS_TEXT)
            .when(prompts::CHARTS, CHARTS_JSON)
    }

    pub fn when(self, needle: &str, reply: &str) -> Self {
        self.when_seq(needle, &[reply])
    }

    pub fn when_seq(self, needle: &str, replies: &[&str]) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push(Rule {
                needle: needle.to_string(),
                replies: replies.iter().map(|r| r.to_string()).collect(),
            });
        self
    }

    /// Sleep before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `(prompt, context)` pair seen so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn answer(&self, prompt: &str) -> Option<String> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| prompt.contains(&r.needle))?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

impl Reasoner for ScriptedReasoner {
    fn reason(&self, prompt: &str, context: &str) -> BoxFuture<'_, Result<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), context.to_string()));
        let answer = self.answer(prompt);
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            answer.ok_or_else(|| LoglensError::LlmRequest("no scripted reply".to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Decision policy
// ---------------------------------------------------------------------------

/// Policy that proposes a fixed sequence of options, then FINISH.
pub struct ScriptedPolicy {
    decisions: Mutex<VecDeque<String>>,
    proposals: AtomicUsize,
}

impl ScriptedPolicy {
    pub fn new(decisions: &[&str]) -> Self {
        Self {
            decisions: Mutex::new(decisions.iter().map(|d| d.to_string()).collect()),
            proposals: AtomicUsize::new(0),
        }
    }

    pub fn proposals(&self) -> usize {
        self.proposals.load(Ordering::SeqCst)
    }
}

impl DecisionPolicy for ScriptedPolicy {
    fn name(&self) -> &str {
        "scripted"
    }

    fn propose<'a>(&'a self, _ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
        self.proposals.fetch_add(1, Ordering::SeqCst);
        let next = self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| loglens_agent::graph::FINISH.to_string());
        Box::pin(async move { Ok(next) })
    }
}

// ---------------------------------------------------------------------------
// Object store, log source, index
// ---------------------------------------------------------------------------

/// Object store kept in a map; URLs are `mem://<key>`.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn store(&self, key: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        self.insert(key, bytes);
        let url = format!("mem://{}", key);
        Box::pin(async move { Ok(url) })
    }

    fn retrieve(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        let found = self
            .get(key)
            .ok_or_else(|| LoglensError::NotFound(key.to_string()));
        Box::pin(async move { found })
    }
}

/// Log source serving fixed bundles by staged key.
#[derive(Default)]
pub struct MemoryLogSource {
    bundles: Mutex<HashMap<String, LogBundle>>,
    fetches: AtomicUsize,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(self, selector: &LogSelector, records: Vec<Value>) -> Self {
        self.bundles
            .lock()
            .unwrap()
            .insert(selector.staged_key(), LogBundle::new(records));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl LogSource for MemoryLogSource {
    fn fetch_logs(&self, selector: &LogSelector) -> BoxFuture<'_, Result<LogBundle>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = selector.staged_key();
        let found = self
            .bundles
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| LoglensError::LogSource(format!("no logs staged at {}", key)));
        Box::pin(async move { found })
    }
}

/// Index returning the same hits for every query, truncated to the limit.
#[derive(Default)]
pub struct MemoryIndex {
    hits: Vec<SearchHit>,
    queries: Mutex<Vec<String>>,
}

impl MemoryIndex {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl KnowledgeIndex for MemoryIndex {
    fn search(&self, query: &str, limit: usize) -> BoxFuture<'_, Result<Vec<SearchHit>>> {
        self.queries.lock().unwrap().push(query.to_string());
        let hits: Vec<SearchHit> = self.hits.iter().take(limit).cloned().collect();
        Box::pin(async move { Ok(hits) })
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Worker replaying a fixed sequence of deltas; the last one repeats.
pub struct ScriptedWorker {
    name: String,
    capability: Capability,
    script: Mutex<VecDeque<Delta>>,
    invocations: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedWorker {
    pub fn new(name: &str, capability: Capability, script: Vec<Delta>) -> Self {
        Self {
            name: name.to_string(),
            capability,
            script: Mutex::new(script.into()),
            invocations: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// A worker that always completes with `content`.
    pub fn completing(name: &str, capability: Capability, content: &str) -> Self {
        Self::new(name, capability, vec![Delta::complete(name, content)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn invoke<'a>(&'a self, _state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let delta = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            delta.ok_or_else(|| LoglensError::Worker {
                worker: self.name.clone(),
                message: "script exhausted".to_string(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn prefetch_records() -> Vec<Value> {
    vec![
        json!({"ExecutableName": "CHROME.EXE", "RunCount": 42, "LastRunTime": "2024-11-18T08:12:00Z"}),
        json!({"ExecutableName": "CMD.EXE", "RunCount": 7, "LastRunTime": "2024-11-18T10:01:00Z"}),
        json!({"ExecutableName": "PSEXEC.EXE", "RunCount": 1, "LastRunTime": "2024-11-18T10:02:00Z"}),
    ]
}

pub fn system_event_records() -> Vec<Value> {
    vec![
        json!({"EventID": 7000, "LevelDisplayName": "Error", "ProviderName": "Service Control Manager", "TimeCreated": "2024-11-18T09:00:00Z"}),
        json!({"EventID": 7036, "LevelDisplayName": "Information", "ProviderName": "Service Control Manager", "TimeCreated": "2024-11-18T09:30:00Z"}),
        json!({"EventID": 7000, "LevelDisplayName": "Error", "ProviderName": "Service Control Manager", "TimeCreated": "2024-11-18T11:00:00Z"}),
    ]
}

pub fn selector(log_type: LogType) -> LogSelector {
    LogSelector {
        computer_id: 7,
        user_id: 1,
        log_type,
        start: Utc.with_ymd_and_hms(2024, 11, 18, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2024, 11, 19, 0, 0, 0).unwrap(),
    }
}

pub fn search_hit(task_id: i64, computer_id: i64, snippet: &str) -> SearchHit {
    SearchHit {
        task_id,
        computer_id,
        task_type: "system".to_string(),
        snippet: snippet.to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 11, 1, 12, 0, 0).unwrap(),
        rank: -1.0,
    }
}

/// Minimal config rooted in `workspace`, rule policy.
pub fn test_config(workspace: &Path) -> AppConfig {
    let toml_str = format!(
        r#"
workspace = "{}"

[model]
provider = "openai"
model_id = "test-model"
"#,
        workspace.display()
    );
    toml::from_str(&toml_str).unwrap()
}
