use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loglens_core::types::LogType;

/// Charts kept per task.
pub const MAX_TASK_CHARTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub organization: String,
}

/// A bearer token issued at sign-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computer {
    pub id: i64,
    pub name: String,
    /// Absent when created through an API key rather than a user session.
    pub owner_id: Option<i64>,
}

/// One finished analysis of one machine's logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub computer_id: i64,
    pub task_type: LogType,
    pub analysis_result: Option<String>,
    /// Up to [`MAX_TASK_CHARTS`] chart URLs, in the order the job produced them.
    pub charts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub computer_id: i64,
    pub task_type: LogType,
    pub analysis_result: Option<String>,
    pub charts: Vec<String>,
}

/// Fields a task update may replace; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub analysis_result: Option<String>,
    #[serde(default)]
    pub charts: Option<Vec<String>>,
}
