use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use loglens_core::error::LoglensError;

use super::node::{Capability, Worker};
use super::state::JobRequest;
use super::supervisor::{Roster, RosterEntry, Supervisor, FINISH};

/// Where a conditional edge leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "to", rename_all = "snake_case")]
pub enum Destination {
    Node(String),
    /// Independent workers run concurrently, then continue at their shared successor.
    FanOut(Vec<String>),
    Terminal,
}

impl Destination {
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(name) => f.write_str(name),
            Self::FanOut(members) => write!(f, "[{}]", members.join(" | ")),
            Self::Terminal => f.write_str("__end__"),
        }
    }
}

/// Graph assembly defects. All are detected by [`GraphBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("no supervisor set")]
    MissingSupervisor,

    #[error("no entry node set")]
    MissingEntry,

    #[error("{context} refers to unregistered node '{node}'")]
    UnknownNode { node: String, context: String },

    #[error("node '{0}' registered twice")]
    DuplicateNode(String),

    #[error("worker '{0}' has no outgoing edge")]
    MissingStaticEdge(String),

    #[error("worker '{0}' has more than one outgoing edge")]
    DuplicateStaticEdge(String),

    #[error("the supervisor routes through conditional edges only")]
    StaticEdgeFromSupervisor,

    #[error("conditional edges miss supervisor options: {}", missing.join(", "))]
    NonTotalConditional { missing: Vec<String> },

    #[error("conditional edge for undeclared option '{0}'")]
    UnknownOption(String),

    #[error("invalid fan-out for option '{option}': {reason}")]
    InvalidFanOut { option: String, reason: String },

    #[error("no registered worker provides required capability '{0}'")]
    UnservedCapability(Capability),
}

impl From<GraphError> for LoglensError {
    fn from(e: GraphError) -> Self {
        LoglensError::Graph(e.to_string())
    }
}

/// Static and conditional transitions, fixed at assembly.
#[derive(Debug, Clone, Default)]
pub struct EdgeTable {
    static_edges: HashMap<String, String>,
    conditional: BTreeMap<String, Destination>,
}

impl EdgeTable {
    pub fn static_successor(&self, from: &str) -> Option<&str> {
        self.static_edges.get(from).map(String::as_str)
    }

    pub fn conditional(&self, option: &str) -> Option<&Destination> {
        self.conditional.get(option)
    }
}

/// Assembles a [`Graph`], validating it once.
#[derive(Default)]
pub struct GraphBuilder {
    workers: Vec<Arc<dyn Worker>>,
    supervisor: Option<Supervisor>,
    static_edges: Vec<(String, String)>,
    conditional: Vec<(String, Destination)>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn set_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.static_edges.push((from.into(), to.into()));
        self
    }

    pub fn add_conditional(mut self, option: impl Into<String>, destination: Destination) -> Self {
        self.conditional.push((option.into(), destination));
        self
    }

    pub fn set_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let supervisor = self.supervisor.ok_or(GraphError::MissingSupervisor)?;

        let mut index = HashMap::new();
        for (i, worker) in self.workers.iter().enumerate() {
            let name = worker.name().to_string();
            if name == supervisor.name() || index.insert(name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(name));
            }
        }
        let is_registered = |name: &str| name == supervisor.name() || index.contains_key(name);

        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        if !is_registered(&entry) {
            return Err(GraphError::UnknownNode {
                node: entry,
                context: "entry".to_string(),
            });
        }

        let mut static_edges = HashMap::new();
        for (from, to) in self.static_edges {
            if from == supervisor.name() {
                return Err(GraphError::StaticEdgeFromSupervisor);
            }
            for node in [&from, &to] {
                if !is_registered(node) {
                    return Err(GraphError::UnknownNode {
                        node: node.clone(),
                        context: format!("static edge {} -> {}", from, to),
                    });
                }
            }
            if static_edges.insert(from.clone(), to).is_some() {
                return Err(GraphError::DuplicateStaticEdge(from));
            }
        }
        if let Some(w) = self
            .workers
            .iter()
            .find(|w| !static_edges.contains_key(w.name()))
        {
            return Err(GraphError::MissingStaticEdge(w.name().to_string()));
        }

        let mut options: Vec<String> = self.workers.iter().map(|w| w.name().to_string()).collect();
        options.push(FINISH.to_string());

        let mut conditional = BTreeMap::new();
        for (option, destination) in self.conditional {
            if !options.contains(&option) {
                return Err(GraphError::UnknownOption(option));
            }
            let destination = match destination {
                Destination::Node(node) => {
                    if !is_registered(&node) {
                        return Err(GraphError::UnknownNode {
                            node,
                            context: format!("conditional edge '{}'", option),
                        });
                    }
                    Destination::Node(node)
                }
                Destination::FanOut(members) => {
                    Destination::FanOut(check_fan_out(&option, members, &index, &static_edges)?)
                }
                Destination::Terminal => Destination::Terminal,
            };
            conditional.insert(option, destination);
        }
        let missing: Vec<String> = options
            .iter()
            .filter(|o| !conditional.contains_key(*o))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(GraphError::NonTotalConditional { missing });
        }

        for capability in &supervisor.rules().required {
            if !self.workers.iter().any(|w| w.capability() == *capability) {
                return Err(GraphError::UnservedCapability(*capability));
            }
        }

        Ok(Graph {
            workers: self.workers,
            index,
            supervisor,
            edges: EdgeTable {
                static_edges,
                conditional,
            },
            entry,
            options,
        })
    }
}

/// Members must be distinct workers sharing one static successor.
/// They are returned in registration order, which is also their merge order.
fn check_fan_out(
    option: &str,
    members: Vec<String>,
    index: &HashMap<String, usize>,
    static_edges: &HashMap<String, String>,
) -> Result<Vec<String>, GraphError> {
    let invalid = |reason: String| GraphError::InvalidFanOut {
        option: option.to_string(),
        reason,
    };
    if members.len() < 2 {
        return Err(invalid("needs at least two workers".to_string()));
    }
    let mut seen = HashSet::new();
    for m in &members {
        if !index.contains_key(m) {
            return Err(invalid(format!("'{}' is not a worker", m)));
        }
        if !seen.insert(m) {
            return Err(invalid(format!("'{}' listed twice", m)));
        }
    }
    let successors: HashSet<&String> = members.iter().filter_map(|m| static_edges.get(m)).collect();
    if successors.len() != 1 {
        return Err(invalid("members do not share one successor".to_string()));
    }
    let mut ordered = members;
    ordered.sort_by_key(|m| index.get(m).copied().unwrap_or(usize::MAX));
    Ok(ordered)
}

/// An assembled, immutable workflow. Shared across concurrent runs via `Arc`.
pub struct Graph {
    workers: Vec<Arc<dyn Worker>>,
    index: HashMap<String, usize>,
    supervisor: Supervisor,
    edges: EdgeTable,
    entry: String,
    options: Vec<String>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn is_supervisor(&self, name: &str) -> bool {
        self.supervisor.name() == name
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<dyn Worker>> {
        self.index.get(name).map(|i| &self.workers[*i])
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Supervisor options: worker names in registration order, then FINISH.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn edges(&self) -> &EdgeTable {
        &self.edges
    }

    /// Workers with their eligibility for one request.
    pub fn roster_for(&self, request: &JobRequest) -> Roster {
        Roster::new(
            self.workers
                .iter()
                .map(|w| RosterEntry {
                    name: w.name().to_string(),
                    capability: w.capability(),
                    eligible: w.accepts(request),
                })
                .collect(),
        )
    }

    pub fn describe(&self) -> GraphDescription {
        let mut nodes = vec![NodeInfo {
            name: self.supervisor.name().to_string(),
            kind: NodeKind::Supervisor,
            capability: None,
        }];
        nodes.extend(self.workers.iter().map(|w| NodeInfo {
            name: w.name().to_string(),
            kind: NodeKind::Worker,
            capability: Some(w.capability()),
        }));

        let mut static_edges: Vec<EdgeInfo> = self
            .workers
            .iter()
            .filter_map(|w| {
                self.edges.static_successor(w.name()).map(|to| EdgeInfo {
                    from: w.name().to_string(),
                    to: to.to_string(),
                })
            })
            .collect();
        static_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let conditional = self
            .options
            .iter()
            .filter_map(|o| {
                self.edges.conditional(o).map(|d| ConditionalInfo {
                    option: o.clone(),
                    destination: d.clone(),
                })
            })
            .collect();

        GraphDescription {
            entry: self.entry.clone(),
            supervisor: self.supervisor.name().to_string(),
            policy: self.supervisor.policy_name().to_string(),
            nodes,
            static_edges,
            conditional,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Supervisor,
    Worker,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionalInfo {
    pub option: String,
    pub destination: Destination,
}

/// Serialisable node and edge listing of a graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphDescription {
    pub entry: String,
    pub supervisor: String,
    pub policy: String,
    pub nodes: Vec<NodeInfo>,
    pub static_edges: Vec<EdgeInfo>,
    pub conditional: Vec<ConditionalInfo>,
}

impl std::fmt::Display for GraphDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "entry: {}", self.entry)?;
        writeln!(f, "supervisor: {} (policy: {})", self.supervisor, self.policy)?;
        for node in &self.nodes {
            if let Some(cap) = node.capability {
                writeln!(f, "  worker {} [{}]", node.name, cap)?;
            }
        }
        for edge in &self.static_edges {
            writeln!(f, "  {} -> {}", edge.from, edge.to)?;
        }
        for c in &self.conditional {
            writeln!(f, "  {} ={}=> {}", self.supervisor, c.option, c.destination)?;
        }
        Ok(())
    }
}
