use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Opaque text-in, text-out reasoning capability.
pub trait Reasoner: Send + Sync + 'static {
    /// Answer `prompt` given supporting `context`.
    fn reason(&self, prompt: &str, context: &str) -> BoxFuture<'_, Result<String>>;
}

/// Raw event-log and prefetch retrieval.
pub trait LogSource: Send + Sync + 'static {
    fn fetch_logs(&self, selector: &LogSelector) -> BoxFuture<'_, Result<LogBundle>>;
}

/// Object-store collaborator.
pub trait ObjectStore: Send + Sync + 'static {
    /// Store bytes under `key`, returning a URL the caller can hand out.
    fn store(&self, key: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<String>>;

    /// Fetch the bytes stored under `key`.
    fn retrieve(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Knowledge index over prior analyses.
pub trait KnowledgeIndex: Send + Sync + 'static {
    fn search(&self, query: &str, limit: usize) -> BoxFuture<'_, Result<Vec<SearchHit>>>;
}
