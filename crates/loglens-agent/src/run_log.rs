use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use loglens_core::event::EventBus;
use loglens_core::types::{EngineEvent, JobId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single job. The bus may carry events of other jobs; those are skipped.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    job_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs are written to `{log_dir}/{job_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run summary, 2 = + decisions and node results, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write entries for `job_id` until cancellation or its `RunFinished`.
    ///
    /// Subscribes when called, so the returned future can be spawned before
    /// the engine starts without missing the first events.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let rx = event_bus.subscribe();
        self.write_events(rx, job_id, cancel)
    }

    async fn write_events(
        self,
        mut rx: tokio::sync::broadcast::Receiver<EngineEvent>,
        job_id: JobId,
        cancel: CancellationToken,
    ) {
        let job_dir = self.log_dir.join(&job_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = job_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if *event.job_id() != job_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, EngineEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type, node: Option<&String>, step: Option<usize>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            job_id: event.job_id().0.clone(),
            event_type,
            node: node.cloned(),
            step,
            detail,
        };

        match event {
            // L1: run summary
            EngineEvent::RunStarted { .. } => Some(entry("run_started", None, None, None)),
            EngineEvent::RunFinished {
                status,
                reason,
                steps,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(*steps),
                Some(serde_json::json!({ "status": status, "reason": reason })),
            )),

            // L2: decisions and node results
            EngineEvent::Decision {
                proposed, decided, ..
            } if self.level >= 2 => Some(entry(
                "decision",
                None,
                None,
                Some(serde_json::json!({
                    "proposed": proposed,
                    "decided": decided,
                    "corrected": proposed != decided,
                })),
            )),
            EngineEvent::NodeFinished {
                node,
                step,
                outcome,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "node_finished",
                Some(node),
                Some(*step),
                Some(serde_json::json!({ "outcome": outcome, "elapsed_ms": elapsed_ms })),
            )),

            // L3: everything else
            EngineEvent::NodeStarted { node, step, .. } if self.level >= 3 => {
                Some(entry("node_started", Some(node), Some(*step), None))
            }
            EngineEvent::MergeAnomaly { node, detail, .. } if self.level >= 3 => Some(entry(
                "merge_anomaly",
                Some(node),
                None,
                Some(serde_json::json!({ "detail": truncate_str(detail, 200) })),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
