use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loglens_core::config::{AppConfig, PolicyKind};
use loglens_core::error::Result;
use loglens_core::event::EventBus;
use loglens_core::traits::{KnowledgeIndex, LogSource, ObjectStore, Reasoner};
use loglens_core::types::{JobId, JobPayload, JobResult, PartialArtifacts};

use crate::graph::{
    DecisionPolicy, Destination, Engine, EngineConfig, EngineState, Graph, GraphBuilder,
    GraphDescription, JobRequest, LlmPolicy, RulePolicy, RunOutcome, SharedState, Supervisor,
    SupervisorRules, Worker, FINISH,
};
use crate::run_log::RunLogger;
use crate::workers::{
    AnalysisWorker, CollectionKind, CollectionWorker, SaveWorker, SearchWorker,
    VisualizationWorker,
};

pub const SUPERVISOR: &str = "team_supervisor";
pub const PREFETCH_COLLECTOR: &str = "data_collection_prefetch_agent";
pub const EVENT_LOG_COLLECTOR: &str = "data_collection_event_log_agent";
pub const SAVER: &str = "data_save_agent";
pub const SEARCHER: &str = "data_search_agent";
pub const ANALYST: &str = "data_analysis_agent";
pub const VISUALIZER: &str = "data_visualization_agent";

/// External capabilities the team's workers are built on.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoner: Arc<dyn Reasoner>,
    pub objects: Arc<dyn ObjectStore>,
    pub log_source: Option<Arc<dyn LogSource>>,
    pub index: Option<Arc<dyn KnowledgeIndex>>,
}

impl Collaborators {
    pub fn new(reasoner: Arc<dyn Reasoner>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            reasoner,
            objects,
            log_source: None,
            index: None,
        }
    }

    pub fn with_log_source(mut self, source: Arc<dyn LogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    /// Enables the search worker.
    pub fn with_index(mut self, index: Arc<dyn KnowledgeIndex>) -> Self {
        self.index = Some(index);
        self
    }
}

/// The forensic log-analysis team: one graph, assembled once, any number of jobs.
pub struct ForensicTeam {
    graph: Arc<Graph>,
    engine: EngineConfig,
    bus: Arc<EventBus>,
    run_log: Option<(PathBuf, u8)>,
}

impl ForensicTeam {
    /// Assemble with the decision policy named in the config.
    pub fn assemble(
        config: &AppConfig,
        collaborators: Collaborators,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let policy: Arc<dyn DecisionPolicy> = match config.engine.policy {
            PolicyKind::Rules => Arc::new(RulePolicy),
            PolicyKind::Llm => Arc::new(LlmPolicy::new(collaborators.reasoner.clone())),
        };
        Self::assemble_with_policy(config, collaborators, bus, policy)
    }

    pub fn assemble_with_policy(
        config: &AppConfig,
        collaborators: Collaborators,
        bus: Arc<EventBus>,
        policy: Arc<dyn DecisionPolicy>,
    ) -> Result<Self> {
        let supervisor = Supervisor::new(SUPERVISOR, policy)
            .with_rules(SupervisorRules::from_settings(&config.engine))
            .with_guard(config.engine.guard);

        let mut prefetch = CollectionWorker::new(PREFETCH_COLLECTOR, CollectionKind::Prefetch);
        let mut event_log = CollectionWorker::new(EVENT_LOG_COLLECTOR, CollectionKind::EventLog);
        if let Some(ref source) = collaborators.log_source {
            prefetch = prefetch.with_source(source.clone());
            event_log = event_log.with_source(source.clone());
        }

        let mut workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(prefetch),
            Arc::new(event_log),
            Arc::new(SaveWorker::new(SAVER, collaborators.objects.clone())),
        ];
        if let Some(ref index) = collaborators.index {
            workers.push(Arc::new(SearchWorker::new(SEARCHER, index.clone())));
        }
        workers.push(Arc::new(AnalysisWorker::new(
            ANALYST,
            collaborators.reasoner.clone(),
        )));
        workers.push(Arc::new(
            VisualizationWorker::new(
                VISUALIZER,
                collaborators.reasoner.clone(),
                collaborators.objects.clone(),
            )
            .with_max_charts(config.engine.max_charts),
        ));

        let mut builder = GraphBuilder::new()
            .set_supervisor(supervisor)
            .set_entry(SUPERVISOR)
            .add_conditional(FINISH, Destination::Terminal);
        for worker in workers {
            let name = worker.name().to_string();
            let successor = match name.as_str() {
                PREFETCH_COLLECTOR | EVENT_LOG_COLLECTOR => SAVER,
                _ => SUPERVISOR,
            };
            builder = builder
                .add_edge(name.clone(), successor)
                .add_conditional(name.clone(), Destination::Node(name))
                .add_worker(worker);
        }
        let graph = builder.build()?;

        info!(
            workers = graph.worker_count(),
            policy = graph.supervisor().policy_name(),
            "Forensic team assembled"
        );
        Ok(Self {
            graph: Arc::new(graph),
            engine: EngineConfig::from_settings(&config.engine),
            bus,
            run_log: None,
        })
    }

    /// Write a JSONL log per job under `dir`.
    pub fn with_run_log(mut self, dir: PathBuf, level: u8) -> Self {
        self.run_log = Some((dir, level));
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn describe(&self) -> GraphDescription {
        self.graph.describe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run one job to completion and project the result.
    pub async fn start_job(&self, payload: JobPayload, cancel: CancellationToken) -> JobResult {
        let request = JobRequest::from_payload(JobId::new(), payload);
        let outcome = self.run_request(request, cancel).await;
        job_result(&outcome)
    }

    /// Run one job with a fresh state and engine, returning the full outcome.
    pub async fn run_request(&self, request: JobRequest, cancel: CancellationToken) -> RunOutcome {
        let job_id = request.job_id.clone();
        let logger = self.run_log.as_ref().map(|(dir, level)| {
            let stop = cancel.child_token();
            let task = RunLogger::new(dir.clone(), *level).run(
                self.bus.clone(),
                job_id.clone(),
                stop.clone(),
            );
            (tokio::spawn(task), stop)
        });

        let engine = Engine::new(self.graph.clone(), self.engine.clone(), self.bus.clone());
        let outcome = engine.run(SharedState::new(request), cancel).await;

        if let Some((handle, stop)) = logger {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!(%job_id, "Run logger did not finish in time");
                stop.cancel();
            }
        }
        outcome
    }
}

/// Caller-facing view of a finished run. Only a terminated run yields a
/// summary; anything accumulated before a failure goes to `partial`.
pub fn job_result(outcome: &RunOutcome) -> JobResult {
    let state = &outcome.state;
    let job_id = state.request().job_id.clone();
    let artifacts = state.artifacts();
    let summary = artifacts
        .summary()
        .or(state.analysis_result())
        .map(String::from);

    if outcome.final_state == EngineState::Terminated {
        return JobResult::completed(job_id, summary.unwrap_or_default(), artifacts.images());
    }

    let (code, detail) = match outcome.failure() {
        Some(reason) => (reason.code(), reason.to_string()),
        None => ("incomplete_run", format!("{:?}", outcome.final_state)),
    };
    JobResult::failed(
        job_id,
        code,
        PartialArtifacts {
            summary,
            images: artifacts.images(),
            messages: state.messages().len(),
            detail: Some(detail),
        },
    )
}
