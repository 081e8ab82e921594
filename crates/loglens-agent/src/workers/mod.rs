//! Forensic workers. Each wraps one collaborator-backed capability.

pub mod analysis;
pub mod collection;
pub mod save;
pub mod search;
pub mod visualization;

pub use analysis::AnalysisWorker;
pub use collection::{CollectionKind, CollectionWorker};
pub use save::SaveWorker;
pub use search::SearchWorker;
pub use visualization::VisualizationWorker;
