pub mod models;
pub mod objects;
pub mod sqlite;
pub mod staged;

pub use models::{AccessToken, Computer, NewTask, Task, TaskUpdate, User, MAX_TASK_CHARTS};
pub use objects::FsObjectStore;
pub use sqlite::SqliteStore;
pub use staged::StagedLogSource;
