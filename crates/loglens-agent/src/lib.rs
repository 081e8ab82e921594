pub mod forensic;
pub mod graph;
pub mod run_log;
pub mod workers;

pub use forensic::{job_result, Collaborators, ForensicTeam};
pub use graph::{
    Delta, Engine, EngineConfig, EngineState, FailureReason, Graph, GraphBuilder, RunOutcome,
    SharedState, Supervisor, Worker,
};
pub use run_log::RunLogger;
