//! TaskStore trait and SQLite implementation
//!
//! All list queries are bounded by a max-age window so an ancient backlog
//! can never flood a worker iteration. Pending tasks are returned in
//! creation order, active tasks in submission order.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use eyre::{Context, Result, eyre};
use rusqlite::{Connection, Row, ToSql};
use tracing::debug;

use crate::task::{EntityType, NewTask, Task, TaskStatus, TaskUpdate};

/// Default window for every list query
const DEFAULT_MAX_AGE_DAYS: i64 = 30;

/// Durable task store consumed by the worker loop
///
/// The worker is the only mutator after task creation; the API layer only
/// inserts PENDING rows and reads status. Exactly one worker process is
/// assumed per store (documented limitation, not enforced by locking).
pub trait TaskStore: Send + Sync {
    /// Insert a new PENDING task, returning its id
    fn create_task(&self, new: &NewTask) -> Result<i64>;

    fn get_task(&self, id: i64) -> Result<Option<Task>>;

    /// Look a task up by the external provider's handle
    fn get_task_by_provider_id(&self, provider_task_id: &str) -> Result<Option<Task>>;

    /// Apply a partial update; returns false when the update is empty or
    /// the row does not exist
    fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool>;

    /// PENDING tasks in ascending creation order
    fn pending_tasks(&self, limit: usize) -> Result<Vec<Task>>;

    /// SUBMITTED/QUEUED/RUNNING tasks in ascending submission order
    fn active_tasks(&self, limit: usize) -> Result<Vec<Task>>;

    /// Active tasks whose `submitted_at` is older than the threshold
    fn timed_out_tasks(&self, timeout_minutes: i64) -> Result<Vec<Task>>;

    /// FAILED tasks with retry budget remaining, in creation order
    fn retryable_tasks(&self) -> Result<Vec<Task>>;

    /// Reset a FAILED task to PENDING, clearing the provider handle and
    /// error message and consuming one retry
    fn reset_for_retry(&self, id: i64) -> Result<bool> {
        self.update_task(id, &TaskUpdate::retry_reset())
    }

    /// Write the generated image reference onto the owning entity row
    fn update_entity_image(&self, entity_type: EntityType, entity_id: i64, image_url: &str, prompt: &str)
    -> Result<()>;

    /// Delete aged-out SUCCESS/FAILED rows; returns the number removed
    fn cleanup_old_tasks(&self, days: i64) -> Result<usize>;

    /// Count of tasks per status
    fn task_stats(&self) -> Result<BTreeMap<String, i64>>;
}

/// SQLite-backed task store
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
    max_age_days: i64,
}

/// Fixed-width UTC timestamp so lexicographic comparison in SQL matches
/// chronological order
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ai_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    prompt TEXT NOT NULL,
    drama_name TEXT,
    episode_number INTEGER,
    entity_name TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    provider_task_id TEXT,
    result_url TEXT,
    storage_key TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    submitted_at TEXT,
    completed_at TEXT,
    last_poll_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_ai_tasks_status ON ai_tasks(status);
CREATE INDEX IF NOT EXISTS idx_ai_tasks_provider ON ai_tasks(provider_task_id);

CREATE TABLE IF NOT EXISTS character_portraits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    character_name TEXT NOT NULL,
    drama_name TEXT,
    episode_number INTEGER,
    image_url TEXT,
    image_prompt TEXT
);
CREATE TABLE IF NOT EXISTS scene_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scene_name TEXT NOT NULL,
    drama_name TEXT,
    episode_number INTEGER,
    image_url TEXT,
    image_prompt TEXT
);
CREATE TABLE IF NOT EXISTS key_prop_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prop_name TEXT NOT NULL,
    drama_name TEXT,
    episode_number INTEGER,
    image_url TEXT,
    image_prompt TEXT
);
";

impl SqliteTaskStore {
    /// Open (creating if necessary) a task store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!(path = %path.as_ref().display(), "SqliteTaskStore::open: called");
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open task store at {}", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        debug!("SqliteTaskStore::open_in_memory: called");
        Self::from_connection(Connection::open_in_memory().context("Failed to open in-memory store")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("Failed to initialize task store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        })
    }

    /// Override the max-age window applied to list queries
    pub fn with_max_age_days(mut self, days: i64) -> Self {
        self.max_age_days = days;
        self
    }

    /// Insert an owning entity row, returning its id
    ///
    /// The API layer normally creates these; seeding tools and tests use
    /// this directly.
    pub fn insert_entity(
        &self,
        entity_type: EntityType,
        name: &str,
        drama_name: Option<&str>,
        episode_number: Option<i64>,
    ) -> Result<i64> {
        debug!(entity_type = %entity_type.as_str(), %name, "SqliteTaskStore::insert_entity: called");
        let name_column = match entity_type {
            EntityType::Character => "character_name",
            EntityType::Scene => "scene_name",
            EntityType::Prop => "prop_name",
        };
        let sql = format!(
            "INSERT INTO {} ({}, drama_name, episode_number) VALUES (?1, ?2, ?3)",
            entity_type.table(),
            name_column
        );

        let conn = self.conn.lock().expect("task store mutex poisoned");
        conn.execute(&sql, rusqlite::params![name, drama_name, episode_number])
            .with_context(|| format!("Failed to insert {} row", entity_type.as_str()))?;
        Ok(conn.last_insert_rowid())
    }

    fn age_cutoff(&self) -> String {
        fmt_ts(Utc::now() - Duration::days(self.max_age_days))
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
        Ok(RawTask {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            prompt: row.get("prompt")?,
            drama_name: row.get("drama_name")?,
            episode_number: row.get("episode_number")?,
            entity_name: row.get("entity_name")?,
            status: row.get("status")?,
            provider_task_id: row.get("provider_task_id")?,
            result_url: row.get("result_url")?,
            storage_key: row.get("storage_key")?,
            error_message: row.get("error_message")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            created_at: row.get("created_at")?,
            submitted_at: row.get("submitted_at")?,
            completed_at: row.get("completed_at")?,
            last_poll_at: row.get("last_poll_at")?,
        })
    }

    fn query_tasks(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let mut stmt = conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, Self::row_to_task)
            .context("Failed to run task query")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }
}

/// Intermediate row shape before enum/timestamp parsing
struct RawTask {
    id: i64,
    task_type: String,
    entity_type: String,
    entity_id: i64,
    prompt: String,
    drama_name: Option<String>,
    episode_number: Option<i64>,
    entity_name: Option<String>,
    status: String,
    provider_task_id: Option<String>,
    result_url: Option<String>,
    storage_key: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    created_at: String,
    submitted_at: Option<String>,
    completed_at: Option<String>,
    last_poll_at: Option<String>,
}

impl RawTask {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            task_type: FromStr::from_str(&self.task_type).map_err(|e: String| eyre!(e))?,
            entity_type: FromStr::from_str(&self.entity_type).map_err(|e: String| eyre!(e))?,
            entity_id: self.entity_id,
            prompt: self.prompt,
            drama_name: self.drama_name,
            episode_number: self.episode_number,
            entity_name: self.entity_name,
            status: FromStr::from_str(&self.status).map_err(|e: String| eyre!(e))?,
            provider_task_id: self.provider_task_id,
            result_url: self.result_url,
            storage_key: self.storage_key,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: parse_ts(&self.created_at)?,
            submitted_at: parse_ts_opt(self.submitted_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            last_poll_at: parse_ts_opt(self.last_poll_at)?,
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn create_task(&self, new: &NewTask) -> Result<i64> {
        debug!(task_type = %new.task_type.as_str(), entity_id = new.entity_id, "SqliteTaskStore::create_task: called");
        let conn = self.conn.lock().expect("task store mutex poisoned");
        conn.execute(
            "INSERT INTO ai_tasks (
                task_type, entity_type, entity_id, prompt,
                drama_name, episode_number, entity_name, max_retries, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                new.task_type.as_str(),
                new.entity_type.as_str(),
                new.entity_id,
                new.prompt,
                new.drama_name,
                new.episode_number,
                new.entity_name,
                new.max_retries,
                fmt_ts(Utc::now()),
            ],
        )
        .context("Failed to insert task")?;

        let id = conn.last_insert_rowid();
        debug!(id, "SqliteTaskStore::create_task: inserted");
        Ok(id)
    }

    fn get_task(&self, id: i64) -> Result<Option<Task>> {
        debug!(id, "SqliteTaskStore::get_task: called");
        let tasks = self.query_tasks("SELECT * FROM ai_tasks WHERE id = ?1", &[&id])?;
        Ok(tasks.into_iter().next())
    }

    fn get_task_by_provider_id(&self, provider_task_id: &str) -> Result<Option<Task>> {
        debug!(%provider_task_id, "SqliteTaskStore::get_task_by_provider_id: called");
        let tasks = self.query_tasks("SELECT * FROM ai_tasks WHERE provider_task_id = ?1", &[&provider_task_id])?;
        Ok(tasks.into_iter().next())
    }

    fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool> {
        debug!(id, ?update, "SqliteTaskStore::update_task: called");
        if update.is_empty() {
            debug!(id, "SqliteTaskStore::update_task: empty update, skipping");
            return Ok(false);
        }

        let now = fmt_ts(Utc::now());
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?".to_string());
            params.push(Box::new(status.as_str()));

            // Lifecycle timestamps follow the status transition
            match status {
                TaskStatus::Submitted => {
                    sets.push("submitted_at = ?".to_string());
                    params.push(Box::new(now.clone()));
                }
                TaskStatus::Queued | TaskStatus::Running => {
                    sets.push("last_poll_at = ?".to_string());
                    params.push(Box::new(now.clone()));
                }
                TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout => {
                    sets.push("completed_at = ?".to_string());
                    params.push(Box::new(now.clone()));
                }
                TaskStatus::Pending => {}
            }
        }

        match &update.provider_task_id {
            Some(Some(handle)) => {
                sets.push("provider_task_id = ?".to_string());
                params.push(Box::new(handle.clone()));
            }
            Some(None) => sets.push("provider_task_id = NULL".to_string()),
            None => {}
        }

        if let Some(url) = &update.result_url {
            sets.push("result_url = ?".to_string());
            params.push(Box::new(url.clone()));
        }

        if let Some(key) = &update.storage_key {
            sets.push("storage_key = ?".to_string());
            params.push(Box::new(key.clone()));
        }

        match &update.error_message {
            Some(Some(message)) => {
                sets.push("error_message = ?".to_string());
                params.push(Box::new(message.clone()));
            }
            Some(None) => sets.push("error_message = NULL".to_string()),
            None => {}
        }

        if update.increment_retry {
            sets.push("retry_count = retry_count + 1".to_string());
        }

        let sql = format!("UPDATE ai_tasks SET {} WHERE id = ?", sets.join(", "));
        params.push(Box::new(id));

        let conn = self.conn.lock().expect("task store mutex poisoned");
        let changed = conn
            .execute(&sql, rusqlite::params_from_iter(params))
            .context("Failed to update task")?;

        debug!(id, changed, "SqliteTaskStore::update_task: done");
        Ok(changed > 0)
    }

    fn pending_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        debug!(limit, "SqliteTaskStore::pending_tasks: called");
        self.query_tasks(
            "SELECT * FROM ai_tasks
             WHERE status = 'PENDING' AND created_at > ?1
             ORDER BY created_at ASC
             LIMIT ?2",
            &[&self.age_cutoff(), &(limit as i64)],
        )
    }

    fn active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        debug!(limit, "SqliteTaskStore::active_tasks: called");
        self.query_tasks(
            "SELECT * FROM ai_tasks
             WHERE status IN ('SUBMITTED', 'QUEUED', 'RUNNING') AND created_at > ?1
             ORDER BY submitted_at ASC
             LIMIT ?2",
            &[&self.age_cutoff(), &(limit as i64)],
        )
    }

    fn timed_out_tasks(&self, timeout_minutes: i64) -> Result<Vec<Task>> {
        debug!(timeout_minutes, "SqliteTaskStore::timed_out_tasks: called");
        let stale_cutoff = fmt_ts(Utc::now() - Duration::minutes(timeout_minutes));
        self.query_tasks(
            "SELECT * FROM ai_tasks
             WHERE status IN ('SUBMITTED', 'QUEUED', 'RUNNING')
             AND submitted_at < ?1
             AND created_at > ?2",
            &[&stale_cutoff, &self.age_cutoff()],
        )
    }

    fn retryable_tasks(&self) -> Result<Vec<Task>> {
        debug!("SqliteTaskStore::retryable_tasks: called");
        self.query_tasks(
            "SELECT * FROM ai_tasks
             WHERE status = 'FAILED'
             AND retry_count < max_retries
             AND created_at > ?1
             ORDER BY created_at ASC",
            &[&self.age_cutoff()],
        )
    }

    fn update_entity_image(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        image_url: &str,
        prompt: &str,
    ) -> Result<()> {
        debug!(entity_type = %entity_type.as_str(), entity_id, %image_url, "SqliteTaskStore::update_entity_image: called");
        // Table name comes from a fixed enum mapping, never from input
        let sql = format!(
            "UPDATE {} SET image_url = ?1, image_prompt = ?2 WHERE id = ?3",
            entity_type.table()
        );

        let conn = self.conn.lock().expect("task store mutex poisoned");
        let changed = conn
            .execute(&sql, rusqlite::params![image_url, prompt, entity_id])
            .with_context(|| format!("Failed to update {} image", entity_type.as_str()))?;

        if changed == 0 {
            return Err(eyre!("{} row {} not found", entity_type.table(), entity_id));
        }
        Ok(())
    }

    fn cleanup_old_tasks(&self, days: i64) -> Result<usize> {
        debug!(days, "SqliteTaskStore::cleanup_old_tasks: called");
        let cutoff = fmt_ts(Utc::now() - Duration::days(days));
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let deleted = conn
            .execute(
                "DELETE FROM ai_tasks
                 WHERE created_at < ?1
                 AND status IN ('SUCCESS', 'FAILED')",
                rusqlite::params![cutoff],
            )
            .context("Failed to clean up old tasks")?;
        debug!(deleted, "SqliteTaskStore::cleanup_old_tasks: done");
        Ok(deleted)
    }

    fn task_stats(&self) -> Result<BTreeMap<String, i64>> {
        debug!("SqliteTaskStore::task_stats: called");
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM ai_tasks GROUP BY status")
            .context("Failed to prepare stats query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to run stats query")?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("Failed to read stats row")?;
            stats.insert(status, count);
        }
        Ok(stats)
    }
}
