use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loglens_core::config::EngineConfig as EngineSettings;
use loglens_core::event::EventBus;
use loglens_core::types::{EngineEvent, JobId};

use super::edge::{Destination, Graph};
use super::node::Worker;
use super::state::{Delta, MergeAnomaly, Outcome, SharedState};
use super::supervisor::Roster;

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    /// A decision or edge named a node the graph does not route to.
    InvalidRoute { from: String, target: String },
    StepBudgetExhausted { budget: usize },
    SupervisorError { message: String },
    Cancelled,
}

impl FailureReason {
    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoute { .. } => "invalid_route",
            Self::StepBudgetExhausted { .. } => "step_budget_exhausted",
            Self::SupervisorError { .. } => "supervisor_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepBudgetExhausted { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRoute { from, target } => {
                write!(f, "invalid_route: {} routed to unknown '{}'", from, target)
            }
            Self::StepBudgetExhausted { budget } => {
                write!(f, "step_budget_exhausted: no terminal after {} steps", budget)
            }
            Self::SupervisorError { message } => write!(f, "supervisor_error: {}", message),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Engine state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Ready(String),
    Running(String),
    Terminated,
    Failed(FailureReason),
}

impl EngineState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed(_))
    }
}

/// Per-run limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum node invocations. `None` means 2 x workers + 1.
    pub step_budget: Option<usize>,
    pub node_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_budget: None,
            node_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            step_budget: settings.step_budget,
            node_timeout: Duration::from_secs(settings.node_timeout_secs),
        }
    }

    pub fn with_step_budget(mut self, budget: usize) -> Self {
        self.step_budget = Some(budget);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn budget_for(&self, workers: usize) -> usize {
        self.step_budget.unwrap_or(2 * workers + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Supervisor,
    Worker,
}

/// One node invocation, as recorded in the run history.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub node: String,
    pub kind: StepKind,
    /// Worker outcome; absent for supervisor steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Supervisor decision; absent for worker steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub messages: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<MergeAnomaly>,
}

/// Everything a finished run hands back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_state: EngineState,
    pub state: SharedState,
    pub history: Vec<StepRecord>,
    pub steps: usize,
}

impl RunOutcome {
    pub fn failure(&self) -> Option<&FailureReason> {
        match self.final_state {
            EngineState::Failed(ref reason) => Some(reason),
            _ => None,
        }
    }
}

/// Drives one shared state through a graph, one node at a time.
///
/// Engines are cheap: one per job, all sharing the same `Arc<Graph>`.
pub struct Engine {
    graph: Arc<Graph>,
    config: EngineConfig,
    bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(graph: Arc<Graph>, config: EngineConfig, bus: Arc<EventBus>) -> Self {
        Self { graph, config, bus }
    }

    pub fn budget(&self) -> usize {
        self.config.budget_for(self.graph.worker_count())
    }

    /// Run from the entry node until the terminal sentinel or a fatal failure.
    ///
    /// `cancel` is checked before every invocation; a cancelled run never
    /// starts another node.
    pub async fn run(&self, mut state: SharedState, cancel: CancellationToken) -> RunOutcome {
        let job_id = state.request().job_id.clone();
        let budget = self.budget();
        let roster = self.graph.roster_for(state.request());
        let run_start = Instant::now();

        info!(%job_id, budget, entry = %self.graph.entry(), "Run started");
        self.bus.publish(EngineEvent::RunStarted {
            job_id: job_id.clone(),
        });

        let mut machine = EngineState::Ready(self.graph.entry().to_string());
        let mut fan_out: Option<Vec<String>> = None;
        let mut history: Vec<StepRecord> = Vec::new();
        let mut steps = 0usize;

        while !machine.is_final() {
            let current = match machine {
                EngineState::Ready(ref name) | EngineState::Running(ref name) => name.clone(),
                EngineState::Terminated | EngineState::Failed(_) => break,
            };

            if cancel.is_cancelled() {
                info!(%job_id, node = %current, "Run cancelled before next step");
                machine = EngineState::Failed(FailureReason::Cancelled);
                continue;
            }

            if self.graph.is_supervisor(&current) {
                if steps + 1 > budget {
                    machine = EngineState::Failed(FailureReason::StepBudgetExhausted { budget });
                    continue;
                }
                steps += 1;
                machine = EngineState::Running(current.clone());
                debug!(%job_id, step = steps, state = ?machine, "Step");
                let (next, group) = self
                    .supervise(&job_id, &current, steps, &mut state, &roster, &mut history)
                    .await;
                machine = next;
                fan_out = group;
                continue;
            }

            let members = fan_out.take().unwrap_or_else(|| vec![current.clone()]);
            let Some(workers) = members
                .iter()
                .map(|m| self.graph.worker(m).cloned())
                .collect::<Option<Vec<Arc<dyn Worker>>>>()
            else {
                machine = EngineState::Failed(FailureReason::InvalidRoute {
                    from: history.last().map(|r| r.node.clone()).unwrap_or_default(),
                    target: current,
                });
                continue;
            };

            if steps + workers.len() > budget {
                machine = EngineState::Failed(FailureReason::StepBudgetExhausted { budget });
                continue;
            }
            machine = EngineState::Running(current.clone());
            debug!(%job_id, step = steps + 1, state = ?machine, members = workers.len(), "Step");

            let first_step = steps + 1;
            let invocations = workers
                .iter()
                .enumerate()
                .map(|(i, w)| self.invoke_worker(&job_id, w.as_ref(), &state, first_step + i));
            let results = join_all(invocations).await;

            // join_all keeps input order, so merges follow registration order.
            for (worker, (delta, elapsed_ms)) in workers.iter().zip(results) {
                steps += 1;
                let outcome = delta.outcome;
                let report = state.merge(delta);
                self.publish_anomalies(&job_id, worker.name(), &report.anomalies);
                self.bus.publish(EngineEvent::NodeFinished {
                    job_id: job_id.clone(),
                    node: worker.name().to_string(),
                    step: steps,
                    outcome,
                    elapsed_ms,
                });
                history.push(StepRecord {
                    step: steps,
                    node: worker.name().to_string(),
                    kind: StepKind::Worker,
                    outcome: Some(outcome),
                    decision: None,
                    messages: report.appended,
                    elapsed_ms,
                    anomalies: report.anomalies,
                });
            }

            machine = match self.graph.edges().static_successor(&members[0]) {
                Some(next) => EngineState::Ready(next.to_string()),
                None => EngineState::Failed(FailureReason::InvalidRoute {
                    from: members[0].clone(),
                    target: String::new(),
                }),
            };
        }

        let (status, reason) = match machine {
            EngineState::Failed(ref r) => ("failed", Some(r.to_string())),
            _ => ("terminated", None),
        };
        match reason {
            Some(ref r) => warn!(%job_id, steps, reason = %r, "Run failed"),
            None => info!(
                %job_id,
                steps,
                elapsed_ms = run_start.elapsed().as_millis() as u64,
                "Run terminated"
            ),
        }
        self.bus.publish(EngineEvent::RunFinished {
            job_id,
            status: status.to_string(),
            reason,
            steps,
        });

        RunOutcome {
            final_state: machine,
            state,
            history,
            steps,
        }
    }

    /// One supervisor step: decide, record, route.
    /// Returns the next machine state and, for fan-out, the members to run.
    async fn supervise(
        &self,
        job_id: &JobId,
        name: &str,
        step: usize,
        state: &mut SharedState,
        roster: &Roster,
        history: &mut Vec<StepRecord>,
    ) -> (EngineState, Option<Vec<String>>) {
        let supervisor = self.graph.supervisor();
        self.bus.publish(EngineEvent::NodeStarted {
            job_id: job_id.clone(),
            node: name.to_string(),
            step,
        });
        let start = Instant::now();

        let ruling = match supervisor.decide(state, roster, self.graph.options()).await {
            Ok(r) => r,
            Err(e) => {
                error!(%job_id, step, error = %e, "Supervisor could not decide");
                history.push(StepRecord {
                    step,
                    node: name.to_string(),
                    kind: StepKind::Supervisor,
                    outcome: None,
                    decision: None,
                    messages: 0,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    anomalies: vec![],
                });
                return (
                    EngineState::Failed(FailureReason::SupervisorError {
                        message: e.to_string(),
                    }),
                    None,
                );
            }
        };

        let mut appended = 0;
        let mut anomalies = vec![];
        if let Some(note) = ruling.correction.clone() {
            let report = state.merge(note);
            appended = report.appended;
            anomalies = report.anomalies;
        }
        // `next` only ever holds a routable option.
        let route = self.graph.edges().conditional(&ruling.decision);
        if route.is_some() {
            state.set_next(ruling.decision.clone());
        }

        debug!(%job_id, step, proposed = %ruling.proposed, decided = %ruling.decision, "Supervisor decided");
        self.bus.publish(EngineEvent::Decision {
            job_id: job_id.clone(),
            proposed: ruling.proposed.clone(),
            decided: ruling.decision.clone(),
        });
        history.push(StepRecord {
            step,
            node: name.to_string(),
            kind: StepKind::Supervisor,
            outcome: None,
            decision: Some(ruling.decision.clone()),
            messages: appended,
            elapsed_ms: start.elapsed().as_millis() as u64,
            anomalies,
        });

        match route {
            None => {
                warn!(%job_id, decision = %ruling.decision, "Decision has no route");
                (
                    EngineState::Failed(FailureReason::InvalidRoute {
                        from: name.to_string(),
                        target: ruling.decision,
                    }),
                    None,
                )
            }
            Some(Destination::Terminal) => (EngineState::Terminated, None),
            Some(Destination::Node(next)) => (EngineState::Ready(next.clone()), None),
            Some(Destination::FanOut(members)) => {
                let first = members.first().cloned().unwrap_or_default();
                (EngineState::Ready(first), Some(members.clone()))
            }
        }
    }

    /// Invoke one worker under its timeout. Errors and timeouts become
    /// failure deltas authored by the worker.
    async fn invoke_worker(
        &self,
        job_id: &JobId,
        worker: &dyn Worker,
        state: &SharedState,
        step: usize,
    ) -> (Delta, u64) {
        let name = worker.name();
        let timeout = worker
            .timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(self.config.node_timeout);

        self.bus.publish(EngineEvent::NodeStarted {
            job_id: job_id.clone(),
            node: name.to_string(),
            step,
        });
        debug!(%job_id, node = %name, step, "Invoking worker");
        let start = Instant::now();

        let delta = match tokio::time::timeout(timeout, worker.invoke(state)).await {
            Ok(Ok(delta)) => delta.authored_by(name),
            Ok(Err(e)) => {
                warn!(%job_id, node = %name, error = %e, "Worker failed");
                Delta::failed(name, format!("{} failed: {}", name, e))
            }
            Err(_) => {
                warn!(%job_id, node = %name, timeout_ms = timeout.as_millis() as u64, "Worker timed out");
                Delta::failed(
                    name,
                    format!("{} timed out after {}ms", name, timeout.as_millis()),
                )
            }
        };
        (delta, start.elapsed().as_millis() as u64)
    }

    fn publish_anomalies(&self, job_id: &JobId, node: &str, anomalies: &[MergeAnomaly]) {
        for anomaly in anomalies {
            self.bus.publish(EngineEvent::MergeAnomaly {
                job_id: job_id.clone(),
                node: node.to_string(),
                detail: anomaly.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::GraphBuilder;
    use crate::graph::node::Capability;
    use crate::graph::state::{keys, JobRequest};
    use crate::graph::supervisor::{
        DecisionContext, DecisionPolicy, RulePolicy, Supervisor, SupervisorRules, FINISH,
    };
    use futures::future::BoxFuture;
    use loglens_core::error::{LoglensError, Result};
    use loglens_core::types::{JobPayload, LogType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Worker that replays a fixed list of deltas, repeating the last one.
    struct Replay {
        name: &'static str,
        capability: Capability,
        script: Vec<Delta>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Replay {
        fn new(name: &'static str, capability: Capability, script: Vec<Delta>) -> Arc<dyn Worker> {
            Arc::new(Self {
                name,
                capability,
                script,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &'static str, capability: Capability, delay: Duration) -> Arc<dyn Worker> {
            Arc::new(Self {
                name,
                capability,
                script: vec![Delta::complete(name, "late")],
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl Worker for Replay {
        fn name(&self) -> &str {
            self.name
        }

        fn capability(&self) -> Capability {
            self.capability
        }

        fn invoke<'a>(&'a self, _state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let i = self.calls.fetch_add(1, Ordering::SeqCst);
                let idx = i.min(self.script.len().saturating_sub(1));
                self.script
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| LoglensError::Worker {
                        worker: self.name.to_string(),
                        message: "empty script".into(),
                    })
            })
        }
    }

    /// Policy that returns its script in order, repeating the last entry.
    struct Script(Vec<&'static str>, AtomicUsize);

    impl Script {
        fn new(script: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self(script, AtomicUsize::new(0)))
        }
    }

    impl DecisionPolicy for Script {
        fn name(&self) -> &str {
            "script"
        }

        fn propose<'a>(&'a self, _ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                let i = self.1.fetch_add(1, Ordering::SeqCst);
                Ok(self.0[i.min(self.0.len() - 1)].to_string())
            })
        }
    }

    fn request() -> SharedState {
        let payload = JobPayload::inline(LogType::Application, vec![json!({"EventID": 1000})]);
        SharedState::new(JobRequest::from_payload(JobId::from_string("job-1"), payload))
    }

    fn rules() -> SupervisorRules {
        SupervisorRules::default()
            .with_required(vec![Capability::Collection, Capability::Analysis])
            .with_required_artifacts(vec![keys::SUMMARY.into()])
    }

    fn graph(policy: Arc<dyn DecisionPolicy>, workers: Vec<Arc<dyn Worker>>) -> Arc<Graph> {
        let mut builder = GraphBuilder::new()
            .set_supervisor(Supervisor::new("sup", policy).with_rules(rules()))
            .set_entry("sup")
            .add_conditional(FINISH, Destination::Terminal);
        for w in workers {
            let name = w.name().to_string();
            builder = builder
                .add_edge(name.clone(), "sup")
                .add_conditional(name.clone(), Destination::Node(name))
                .add_worker(w);
        }
        Arc::new(builder.build().unwrap())
    }

    fn engine(graph: Arc<Graph>, config: EngineConfig) -> Engine {
        Engine::new(graph, config, Arc::new(EventBus::default()))
    }

    fn collector() -> Arc<dyn Worker> {
        Replay::new(
            "collect",
            Capability::Collection,
            vec![Delta::complete("collect", "collected 1 record")],
        )
    }

    fn analyst(script: Vec<Delta>) -> Arc<dyn Worker> {
        Replay::new("analyze", Capability::Analysis, script)
    }

    fn good_analysis() -> Delta {
        Delta::complete("analyze", "3 errors in 1 hour")
            .with_analysis("3 errors in 1 hour")
            .with_artifact(keys::SUMMARY, json!("3 errors in 1 hour"))
    }

    #[tokio::test]
    async fn test_rule_policy_reaches_terminal() {
        let g = graph(Arc::new(RulePolicy), vec![collector(), analyst(vec![good_analysis()])]);
        let out = engine(g, EngineConfig::default()).run(request(), CancellationToken::new()).await;

        assert_eq!(out.final_state, EngineState::Terminated);
        let nodes: Vec<&str> = out.history.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(nodes, vec!["sup", "collect", "sup", "analyze", "sup"]);
        assert_eq!(out.steps, 5);
        assert_eq!(out.state.next(), Some(FINISH));
        assert_eq!(out.state.analysis_result(), Some("3 errors in 1 hour"));
    }

    #[tokio::test]
    async fn test_reinvocation_after_incomplete() {
        let a = analyst(vec![
            Delta::incomplete("analyze", "too short").with_analysis("x"),
            good_analysis(),
        ]);
        let g = graph(Arc::new(RulePolicy), vec![collector(), a]);
        let out = engine(g, EngineConfig::default().with_step_budget(9))
            .run(request(), CancellationToken::new())
            .await;

        assert_eq!(out.final_state, EngineState::Terminated);
        assert_eq!(out.steps, 7);
        assert_eq!(out.state.messages_by("analyze").count(), 2);
        assert_eq!(out.state.analysis_result(), Some("3 errors in 1 hour"));
    }

    #[tokio::test]
    async fn test_unregistered_decision_is_invalid_route() {
        let g = graph(Script::new(vec!["ghost"]), vec![collector(), analyst(vec![good_analysis()])]);
        let out = engine(g, EngineConfig::default()).run(request(), CancellationToken::new()).await;

        assert_eq!(
            out.final_state,
            EngineState::Failed(FailureReason::InvalidRoute {
                from: "sup".into(),
                target: "ghost".into()
            })
        );
        assert_eq!(out.steps, 1);
        assert_eq!(out.state.next(), None);
    }

    #[tokio::test]
    async fn test_budget_exhausted_exactly_at_bound() {
        let a = analyst(vec![Delta::incomplete("analyze", "never good enough")]);
        let g = graph(Script::new(vec!["analyze"]), vec![collector(), a]);
        let out = engine(g, EngineConfig::default().with_step_budget(7))
            .run(request(), CancellationToken::new())
            .await;

        assert_eq!(
            out.final_state,
            EngineState::Failed(FailureReason::StepBudgetExhausted { budget: 7 })
        );
        assert_eq!(out.steps, 7);
        assert_eq!(out.history.len(), 7);
        assert!(out.failure().is_some_and(|r| r.is_retryable()));
    }

    #[tokio::test]
    async fn test_default_budget() {
        let g = graph(Arc::new(RulePolicy), vec![collector(), analyst(vec![good_analysis()])]);
        assert_eq!(engine(g, EngineConfig::default()).budget(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let g = graph(Arc::new(RulePolicy), vec![collector(), analyst(vec![good_analysis()])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = engine(g, EngineConfig::default()).run(request(), cancel).await;

        assert_eq!(out.final_state, EngineState::Failed(FailureReason::Cancelled));
        assert_eq!(out.steps, 0);
        assert_eq!(out.state.messages().len(), 1);
    }

    /// Worker that cancels the run from inside its own invocation.
    struct CancelsRun(CancellationToken);

    impl Worker for CancelsRun {
        fn name(&self) -> &str {
            "collect"
        }

        fn capability(&self) -> Capability {
            Capability::Collection
        }

        fn invoke<'a>(&'a self, _state: &'a SharedState) -> BoxFuture<'a, Result<Delta>> {
            Box::pin(async move {
                self.0.cancel();
                Ok(Delta::complete("collect", "collected 1 record"))
            })
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_run_starts_nothing_more() {
        let cancel = CancellationToken::new();
        let collect: Arc<dyn Worker> = Arc::new(CancelsRun(cancel.clone()));
        let g = graph(
            Script::new(vec!["collect", "analyze", FINISH]),
            vec![collect, analyst(vec![good_analysis()])],
        );
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let out = Engine::new(g, EngineConfig::default(), bus)
            .run(request(), cancel)
            .await;

        assert_eq!(out.final_state, EngineState::Failed(FailureReason::Cancelled));
        let nodes: Vec<&str> = out.history.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(nodes, vec!["sup", "collect"]);
        assert_eq!(out.steps, 2);
        assert_eq!(out.state.messages_by("collect").count(), 1);

        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let finished = events
            .iter()
            .position(|e| matches!(e, EngineEvent::NodeFinished { node, .. } if node == "collect"))
            .unwrap();
        assert!(!events[finished..]
            .iter()
            .any(|e| matches!(e, EngineEvent::NodeStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::RunFinished { reason: Some(r), .. }) if r == "cancelled"
        ));
    }

    #[tokio::test]
    async fn test_worker_timeout_becomes_failure_delta() {
        let slow = Replay::slow("collect", Capability::Collection, Duration::from_millis(200));
        let g = graph(
            Script::new(vec!["collect", FINISH]),
            vec![slow, analyst(vec![good_analysis()])],
        );
        let out = engine(
            g,
            EngineConfig::default().with_node_timeout(Duration::from_millis(20)),
        )
        .run(request(), CancellationToken::new())
        .await;

        let record = &out.history[1];
        assert_eq!(record.node, "collect");
        assert_eq!(record.outcome, Some(Outcome::Failed));
        let msg = out.state.messages_by("collect").next().unwrap();
        assert!(msg.content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_fan_out_merges_in_registration_order() {
        let slow = Replay::slow("collect_a", Capability::Collection, Duration::from_millis(30));
        let fast = Replay::new(
            "collect_b",
            Capability::Collection,
            vec![Delta::complete("collect_b", "fast")],
        );
        let g = GraphBuilder::new()
            .add_worker(slow)
            .add_worker(fast)
            .add_worker(analyst(vec![good_analysis()]))
            .set_supervisor(Supervisor::new("sup", Script::new(vec!["collect_a", "analyze", FINISH])).with_rules(rules()))
            .set_entry("sup")
            .add_edge("collect_a", "sup")
            .add_edge("collect_b", "sup")
            .add_edge("analyze", "sup")
            .add_conditional(
                "collect_a",
                Destination::FanOut(vec!["collect_b".into(), "collect_a".into()]),
            )
            .add_conditional("collect_b", Destination::node("collect_b"))
            .add_conditional("analyze", Destination::node("analyze"))
            .add_conditional(FINISH, Destination::Terminal)
            .build()
            .unwrap();

        let out = engine(Arc::new(g), EngineConfig::default())
            .run(request(), CancellationToken::new())
            .await;

        assert_eq!(out.final_state, EngineState::Terminated);
        let authors: Vec<&str> = out.state.messages()[1..3]
            .iter()
            .map(|m| m.author.as_str())
            .collect();
        assert_eq!(authors, vec!["collect_a", "collect_b"]);
        assert_eq!(out.history[1].step, 2);
        assert_eq!(out.history[2].step, 3);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let g = graph(Arc::new(RulePolicy), vec![collector(), analyst(vec![good_analysis()])]);
        Engine::new(g, EngineConfig::default(), bus)
            .run(request(), CancellationToken::new())
            .await;

        let mut saw_started = false;
        let mut decisions = 0;
        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::RunStarted { .. } => saw_started = true,
                EngineEvent::Decision { .. } => decisions += 1,
                EngineEvent::RunFinished { status, steps, .. } => finished = Some((status, steps)),
                _ => {}
            }
        }
        assert!(saw_started);
        assert_eq!(decisions, 3);
        assert_eq!(finished, Some(("terminated".to_string(), 5)));
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(FailureReason::Cancelled.code(), "cancelled");
        assert_eq!(
            FailureReason::SupervisorError { message: "x".into() }.code(),
            "supervisor_error"
        );
        assert!(!FailureReason::InvalidRoute {
            from: "a".into(),
            target: "b".into()
        }
        .is_retryable());
    }
}
