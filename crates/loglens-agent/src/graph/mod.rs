//! Orchestration engine: a supervisor-driven workflow over a shared state.
//!
//! A graph is a set of [`Worker`]s plus one [`Supervisor`]. Workers hand
//! their results back through static edges; the supervisor picks the next
//! worker (or FINISH) through conditional edges keyed by its options. The
//! [`Engine`] walks the graph one node at a time, merging each node's
//! [`Delta`] into the [`SharedState`] under append-only and set-once rules.

pub mod edge;
pub mod executor;
pub mod node;
pub mod state;
pub mod supervisor;

pub use edge::{Destination, Graph, GraphBuilder, GraphDescription, GraphError};
pub use executor::{Engine, EngineConfig, EngineState, FailureReason, RunOutcome, StepRecord};
pub use node::{Capability, Worker};
pub use state::{Artifacts, Delta, JobRequest, MergeAnomaly, MergeReport, Message, Outcome, SharedState};
pub use supervisor::{
    DecisionContext, DecisionPolicy, LlmPolicy, Roster, RulePolicy, Supervisor, SupervisorError,
    SupervisorRules, FINISH,
};
