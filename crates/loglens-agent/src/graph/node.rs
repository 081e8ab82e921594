use futures::future::BoxFuture;

use loglens_core::error::Result;

pub use loglens_core::types::Capability;

use super::state::{Delta, JobRequest, SharedState};

/// A unit of domain work in the graph.
///
/// A worker reads what it needs from the shared state and reports back with a
/// [`Delta`]. Returning `Err` is fine: the engine converts errors and timeouts
/// into a failure delta authored by the worker, so the supervisor sees them.
pub trait Worker: Send + Sync + 'static {
    /// Node name, unique within a graph.
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn invoke<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, Result<Delta>>;

    /// Override the engine-wide per-node timeout.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Whether this worker can serve the request at all. The supervisor
    /// picks among eligible workers when several share a capability.
    fn accepts(&self, _request: &JobRequest) -> bool {
        true
    }
}
