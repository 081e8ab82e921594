use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::KnowledgeIndex;
use loglens_core::types::{LogType, SearchHit};

use crate::models::{AccessToken, Computer, NewTask, Task, TaskUpdate, User, MAX_TASK_CHARTS};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        organization TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tokens (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS computers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        owner_id INTEGER REFERENCES users(id) ON DELETE SET NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        computer_id INTEGER NOT NULL REFERENCES computers(id) ON DELETE CASCADE,
        task_type TEXT NOT NULL,
        analysis_result TEXT,
        chart1 TEXT,
        chart2 TEXT,
        chart3 TEXT,
        chart4 TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_computer ON tasks(computer_id, id);

    CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts USING fts5(
        analysis_result,
        task_type,
        computer_id UNINDEXED,
        created_at UNINDEXED,
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS tasks_ai AFTER INSERT ON tasks BEGIN
        INSERT INTO tasks_fts(rowid, analysis_result, task_type, computer_id, created_at)
        VALUES (new.id, coalesce(new.analysis_result, ''), new.task_type, new.computer_id, new.created_at);
    END;

    CREATE TRIGGER IF NOT EXISTS tasks_ad AFTER DELETE ON tasks BEGIN
        DELETE FROM tasks_fts WHERE rowid = old.id;
    END;

    CREATE TRIGGER IF NOT EXISTS tasks_au AFTER UPDATE ON tasks BEGIN
        DELETE FROM tasks_fts WHERE rowid = old.id;
        INSERT INTO tasks_fts(rowid, analysis_result, task_type, computer_id, created_at)
        VALUES (new.id, coalesce(new.analysis_result, ''), new.task_type, new.computer_id, new.created_at);
    END;
";

const TASK_COLUMNS: &str =
    "id, computer_id, task_type, analysis_result, chart1, chart2, chart3, chart4, created_at";

fn db_err(e: impl std::fmt::Display) -> LoglensError {
    LoglensError::Database(e.to_string())
}

/// SQLite-backed users, computers, and tasks, with FTS5 search over past analyses.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers while a job result is written.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;

        let store = Self::init(conn)?;
        debug!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    // -- users ----------------------------------------------------------------

    /// Register a user. Returns `None` when the email is already taken.
    pub fn create_user(
        &self,
        email: &str,
        password: &str,
        organization: &str,
    ) -> Result<Option<User>> {
        let password_hash = hash_password(password)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO users (email, password_hash, organization, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                email,
                password_hash,
                organization,
                Utc::now().to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                info!(user_id = id, "User registered");
                Ok(Some(User {
                    id,
                    email: email.to_string(),
                    organization: organization.to_string(),
                }))
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(None)
            }
            Err(e) => Err(db_err(e)),
        }
    }

    /// Check credentials. Unknown email and wrong password look the same.
    pub fn verify_user(&self, email: &str, password: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, password_hash, organization FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        Ok(row.and_then(|(id, stored, organization)| {
            verify_password(password, &stored).then(|| User {
                id,
                email: email.to_string(),
                organization,
            })
        }))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, organization FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    organization: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    // -- tokens ---------------------------------------------------------------

    pub fn issue_token(&self, user_id: i64, ttl_minutes: i64) -> Result<AccessToken> {
        let token = AccessToken {
            token: uuid::Uuid::new_v4().to_string(),
            user_id,
            expires_at: Utc::now() + Duration::minutes(ttl_minutes),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tokens (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token.token, token.user_id, token.expires_at.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(token)
    }

    /// The user a live token belongs to. Expired tokens are removed on sight.
    pub fn resolve_token(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT user_id, expires_at FROM tokens WHERE token = ?1",
                params![token],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };
        let expired = parse_time(&expires_at).map_or(true, |t| t <= Utc::now());
        if expired {
            conn.execute("DELETE FROM tokens WHERE token = ?1", params![token])
                .map_err(db_err)?;
            return Ok(None);
        }
        Ok(Some(user_id))
    }

    pub fn purge_expired_tokens(&self) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM tokens WHERE expires_at <= ?1",
            params![Utc::now().to_rfc3339()],
        )
        .map_err(db_err)
    }

    // -- computers ------------------------------------------------------------

    pub fn create_computer(&self, name: &str, owner_id: Option<i64>) -> Result<Computer> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO computers (name, owner_id) VALUES (?1, ?2)",
            params![name, owner_id],
        )
        .map_err(db_err)?;
        Ok(Computer {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            owner_id,
        })
    }

    pub fn get_computer(&self, id: i64) -> Result<Option<Computer>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, owner_id FROM computers WHERE id = ?1",
            params![id],
            computer_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// All computers, or only those owned by `owner_id`.
    pub fn list_computers(&self, owner_id: Option<i64>) -> Result<Vec<Computer>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, owner_id FROM computers
                 WHERE ?1 IS NULL OR owner_id = ?1
                 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![owner_id], computer_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn update_computer(&self, id: i64, name: &str) -> Result<Option<Computer>> {
        {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE computers SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_computer(id)
    }

    /// Delete a computer and every task recorded for it.
    pub fn delete_computer(&self, id: i64) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM tasks WHERE computer_id = ?1", params![id])
            .map_err(db_err)?;
        let deleted = tx
            .execute("DELETE FROM computers WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(deleted > 0)
    }

    // -- tasks ----------------------------------------------------------------

    /// Persist a task. Charts beyond [`MAX_TASK_CHARTS`] are dropped.
    pub fn create_task(&self, task: &NewTask) -> Result<Task> {
        let created_at = Utc::now();
        let charts = chart_slots(&task.charts);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (computer_id, task_type, analysis_result,
                                chart1, chart2, chart3, chart4, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.computer_id,
                task.task_type.as_str(),
                task.analysis_result,
                charts[0],
                charts[1],
                charts[2],
                charts[3],
                created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        debug!(task_id = id, computer_id = task.computer_id, "Task stored");

        Ok(Task {
            id,
            computer_id: task.computer_id,
            task_type: task.task_type,
            analysis_result: task.analysis_result.clone(),
            charts: charts.into_iter().flatten().collect(),
            created_at,
        })
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            task_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_tasks(&self, computer_id: i64) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE computer_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![computer_id], task_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<Option<Task>> {
        let Some(mut task) = self.get_task(id)? else {
            return Ok(None);
        };
        if let Some(ref analysis) = update.analysis_result {
            task.analysis_result = Some(analysis.clone());
        }
        if let Some(ref charts) = update.charts {
            task.charts = charts.iter().take(MAX_TASK_CHARTS).cloned().collect();
        }

        let charts = chart_slots(&task.charts);
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET analysis_result = ?1,
                              chart1 = ?2, chart2 = ?3, chart3 = ?4, chart4 = ?5
             WHERE id = ?6",
            params![
                task.analysis_result,
                charts[0],
                charts[1],
                charts[2],
                charts[3],
                id
            ],
        )
        .map_err(db_err)?;
        Ok(Some(task))
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // -- search ---------------------------------------------------------------

    /// Full-text search over stored analyses and their log types, best first.
    pub fn search_tasks(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT rowid, computer_id, task_type,
                        snippet(tasks_fts, 0, '', '', '...', 32),
                        created_at, rank
                 FROM tasks_fts
                 WHERE tasks_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                let created_at: String = row.get(4)?;
                Ok(SearchHit {
                    task_id: row.get(0)?,
                    computer_id: row.get(1)?,
                    task_type: row.get(2)?,
                    snippet: row.get(3)?,
                    created_at: parse_time(&created_at).unwrap_or_else(Utc::now),
                    rank: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl KnowledgeIndex for SqliteStore {
    fn search(&self, query: &str, limit: usize) -> BoxFuture<'_, Result<Vec<SearchHit>>> {
        let query = query.to_string();
        Box::pin(async move { self.search_tasks(&query, limit) })
    }
}

/// Quote every word so user text never parses as FTS5 syntax; any word may match.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn chart_slots(charts: &[String]) -> [Option<String>; MAX_TASK_CHARTS] {
    let mut slots: [Option<String>; MAX_TASK_CHARTS] = Default::default();
    for (slot, url) in slots.iter_mut().zip(charts) {
        *slot = Some(url.clone());
    }
    slots
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn computer_from_row(row: &Row<'_>) -> rusqlite::Result<Computer> {
    Ok(Computer {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(2)?;
    let task_type = LogType::parse(&task_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown task type '{}'", task_type).into(),
        )
    })?;
    let created_at: String = row.get(8)?;
    let created_at = parse_time(&created_at).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("bad timestamp '{}'", created_at).into(),
        )
    })?;
    let mut charts = Vec::new();
    for idx in 4..8 {
        if let Some(url) = row.get::<_, Option<String>>(idx)? {
            charts.push(url);
        }
    }
    Ok(Task {
        id: row.get(0)?,
        computer_id: row.get(1)?,
        task_type,
        analysis_result: row.get(3)?,
        charts,
        created_at,
    })
}

/// bcrypt with the crate's default work factor. The salt lives in the hash.
fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(db_err)
}

/// Malformed or legacy hashes never verify.
fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}
