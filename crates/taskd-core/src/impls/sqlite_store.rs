//! SQLite-backed task store.
//!
//! One `tasks` table; timestamps are RFC 3339 text with microseconds so
//! lexical order equals time order. `rowid` breaks `created_at` ties.
//!
//! rusqlite is synchronous, so every call runs on `spawn_blocking` against a
//! mutex-guarded connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};

use crate::domain::{
    ListFilter, NewTask, RecoveryReport, Task, TaskCounts, TaskId, TaskPage, TaskStatus,
    TaskUpdate,
};
use crate::ports::{Clock, DeleteOutcome, StoreError, SystemClock, TaskStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    prompt       TEXT NOT NULL,
    project_dir  TEXT,
    status       TEXT NOT NULL DEFAULT 'pending',
    output       TEXT,
    error        TEXT,
    exit_code    INTEGER,
    session_id   TEXT,
    tokens_used  INTEGER,
    cost_usd     REAL,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    notified     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
"#;

const COLUMNS: &str = "id, prompt, project_dir, status, output, error, exit_code, session_id, \
                       tokens_used, cost_usd, created_at, started_at, completed_at, notified";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file, switching it to WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::from_connection(conn, Arc::new(SystemClock))?;
        info!(path = %path.display(), "task database ready");
        Ok(store)
    }

    /// Private database that disappears with the store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Join("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Saturates instead of wrapping; SQLite reads a negative OFFSET as 0.
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn opt_text(v: &Option<String>) -> Value {
    v.clone().map_or(Value::Null, Value::Text)
}

/// Column assignments for every field set in `update`.
fn assignments(update: &TaskUpdate) -> Vec<(&'static str, Value)> {
    let mut sets = Vec::new();
    if let Some(status) = update.status {
        sets.push(("status", Value::Text(status.as_str().to_string())));
    }
    if let Some(output) = &update.output {
        sets.push(("output", opt_text(output)));
    }
    if let Some(error) = &update.error {
        sets.push(("error", opt_text(error)));
    }
    if let Some(exit_code) = update.exit_code {
        sets.push(("exit_code", exit_code.map_or(Value::Null, |c| Value::Integer(c.into()))));
    }
    if let Some(session_id) = &update.session_id {
        sets.push(("session_id", opt_text(session_id)));
    }
    if let Some(tokens) = update.tokens_used {
        sets.push(("tokens_used", tokens.map_or(Value::Null, Value::Integer)));
    }
    if let Some(cost) = update.cost_usd {
        sets.push(("cost_usd", cost.map_or(Value::Null, Value::Real)));
    }
    if let Some(started_at) = update.started_at {
        sets.push(("started_at", started_at.map_or(Value::Null, |t| Value::Text(ts(t)))));
    }
    if let Some(completed_at) = update.completed_at {
        sets.push(("completed_at", completed_at.map_or(Value::Null, |t| Value::Text(ts(t)))));
    }
    if let Some(notified) = update.notified {
        sets.push(("notified", Value::Integer(notified.into())));
    }
    sets
}

/// Run `UPDATE tasks SET .. WHERE id = ? [AND status IN (..)]`.
fn apply_update(
    conn: &Connection,
    id: &str,
    update: &TaskUpdate,
    from: Option<&[TaskStatus]>,
) -> Result<bool, StoreError> {
    let sets = assignments(update);
    if sets.is_empty() {
        // nothing to write, report whether the row exists
        let exists = conn
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        return Ok(exists.is_some());
    }

    let set_clause = sets
        .iter()
        .map(|(col, _)| format!("{col} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("UPDATE tasks SET {set_clause} WHERE id = ?");
    let mut values: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
    values.push(Value::Text(id.to_string()));

    if let Some(from) = from {
        if from.is_empty() {
            return Ok(false);
        }
        let marks = vec!["?"; from.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({marks})"));
        values.extend(from.iter().map(|s| Value::Text(s.as_str().to_string())));
    }

    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

/// Raw column values, decoded into a [`Task`] outside the rusqlite callback.
struct TaskRow {
    id: String,
    prompt: String,
    project_dir: Option<String>,
    status: String,
    output: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
    session_id: Option<String>,
    tokens_used: Option<i64>,
    cost_usd: Option<f64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    notified: bool,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            project_dir: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            exit_code: row.get(6)?,
            session_id: row.get(7)?,
            tokens_used: row.get(8)?,
            cost_usd: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
            notified: row.get::<_, i64>(13)? != 0,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let parse_ts = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {raw:?}: {e}")))
        };

        let id = self.id.parse::<TaskId>().map_err(|e| corrupt(e.to_string()))?;
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let created_at = parse_ts(&self.created_at)?;
        let started_at = self.started_at.as_deref().map(parse_ts).transpose()?;
        let completed_at = self.completed_at.as_deref().map(parse_ts).transpose()?;

        Ok(Task {
            id,
            prompt: self.prompt,
            project_dir: self.project_dir,
            status,
            output: self.output,
            error: self.error,
            exit_code: self.exit_code,
            session_id: self.session_id,
            tokens_used: self.tokens_used,
            cost_usd: self.cost_usd,
            created_at,
            started_at,
            completed_at,
            notified: self.notified,
        })
    }
}

fn select_one(conn: &Connection, sql: &str, id: Option<&str>) -> Result<Option<Task>, StoreError> {
    let row = match id {
        Some(id) => conn.query_row(sql, [id], TaskRow::read).optional()?,
        None => conn.query_row(sql, [], TaskRow::read).optional()?,
    };
    row.map(TaskRow::into_task).transpose()
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, id: TaskId, new: NewTask) -> Result<Task, StoreError> {
        let task = Task::new(id, new, self.clock.now());
        let row = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, prompt, project_dir, status, created_at, notified) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    row.id.to_string(),
                    row.prompt,
                    row.project_dir,
                    row.status.as_str(),
                    ts(row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;
        debug!(task_id = %task.id, "task inserted");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
            select_one(conn, &sql, Some(&id))
        })
        .await
    }

    async fn list(&self, filter: ListFilter) -> Result<TaskPage, StoreError> {
        self.with_conn(move |conn| {
            let (where_clause, mut args): (&str, Vec<Value>) = match filter.status {
                Some(s) => ("WHERE status = ?", vec![Value::Text(s.as_str().to_string())]),
                None => ("", Vec::new()),
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM tasks {where_clause}"),
                params_from_iter(args.clone()),
                |row| row.get(0),
            )?;

            args.push(Value::Integer(sql_count(filter.limit)));
            args.push(Value::Integer(sql_count(filter.offset)));
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks {where_clause} \
                 ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), TaskRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            let tasks = rows
                .into_iter()
                .map(TaskRow::into_task)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(TaskPage {
                tasks,
                total: total.max(0) as u64,
            })
        })
        .await
    }

    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| apply_update(conn, &id, &update, None))
            .await
    }

    async fn transition(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError> {
        let Some(next) = update.status else {
            return Ok(false);
        };
        let id = id.to_string();
        self.with_conn(move |conn| apply_update(conn, &id, &update, Some(next.predecessors())))
            .await
    }

    async fn delete(&self, id: &TaskId) -> Result<DeleteOutcome, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let status: Option<String> = tx
                .query_row("SELECT status FROM tasks WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(status) = status else {
                return Ok(DeleteOutcome::NotFound);
            };
            let status = status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;
            if status.is_active() {
                return Ok(DeleteOutcome::Active(status));
            }
            tx.execute("DELETE FROM tasks WHERE id = ?1", [&id])?;
            tx.commit()?;
            Ok(DeleteOutcome::Deleted)
        })
        .await
    }

    async fn oldest_pending(&self) -> Result<Option<Task>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks WHERE status = 'pending' \
                 ORDER BY created_at ASC, rowid ASC LIMIT 1"
            );
            select_one(conn, &sql, None)
        })
        .await
    }

    async fn reset_running_to_pending(&self) -> Result<RecoveryReport, StoreError> {
        let now = ts(self.clock.now());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let requeued = tx.execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL WHERE status = 'running'",
                [],
            )?;
            let cancelled = tx.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1 \
                 WHERE status = 'cancelling'",
                [&now],
            )?;
            tx.commit()?;
            Ok(RecoveryReport {
                requeued,
                cancelled,
            })
        })
        .await
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = TaskCounts::default();
            for (status, n) in rows {
                let status = status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
                    id: "<aggregate>".to_string(),
                    reason: e.to_string(),
                })?;
                counts.add(status, n.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunRecord;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn new_task(prompt: &str, project_dir: Option<&str>) -> NewTask {
        NewTask {
            prompt: prompt.into(),
            project_dir: project_dir.map(Into::into),
        }
    }

    fn frozen_store() -> (Arc<FixedClock>, SqliteTaskStore) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap(),
        ));
        let store = SqliteTaskStore::in_memory().unwrap().with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn create_and_get_round_trip_all_fields() {
        let (clock, store) = frozen_store();
        let task = store
            .create(id(), new_task("write docs", Some("/projects/site")))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(3));
        let started = clock.now();
        assert!(store.transition(&task.id, TaskUpdate::claim(started)).await.unwrap());

        let record = RunRecord {
            output: Some("done".into()),
            error: None,
            exit_code: Some(0),
            session_id: Some("abc".into()),
            tokens_used: Some(15),
            cost_usd: Some(0.25),
        };
        let finished = started + chrono::Duration::seconds(30);
        let update = TaskUpdate::finish(TaskStatus::Completed, record, finished);
        assert!(store.transition(&task.id, update).await.unwrap());

        let got = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert_eq!(got.project_dir.as_deref(), Some("/projects/site"));
        assert_eq!(got.output.as_deref(), Some("done"));
        assert_eq!(got.session_id.as_deref(), Some("abc"));
        assert_eq!(got.tokens_used, Some(15));
        assert_eq!(got.cost_usd, Some(0.25));
        assert_eq!(got.created_at, task.created_at);
        assert_eq!(got.started_at, Some(started));
        assert_eq!(got.completed_at, Some(finished));
        assert!(!got.notified);
    }

    #[tokio::test]
    async fn oldest_pending_uses_created_at_then_insertion_order() {
        let (clock, store) = frozen_store();
        let a = store.create(id(), new_task("a", None)).await.unwrap();
        let b = store.create(id(), new_task("b", None)).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let _c = store.create(id(), new_task("c", None)).await.unwrap();

        assert_eq!(store.oldest_pending().await.unwrap().unwrap().id, a.id);
        store.transition(&a.id, TaskUpdate::claim(clock.now())).await.unwrap();
        assert_eq!(store.oldest_pending().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn list_filters_pages_and_counts() {
        let (clock, store) = frozen_store();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.create(id(), new_task(&format!("t{n}"), None)).await.unwrap().id);
            clock.advance(chrono::Duration::seconds(1));
        }
        store
            .transition(&ids[0], TaskUpdate::cancelled(clock.now()))
            .await
            .unwrap();

        let page = store
            .list(ListFilter {
                status: Some(TaskStatus::Pending),
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        let got: Vec<_> = page.tasks.iter().map(|t| t.id).collect();
        assert_eq!(got, vec![ids[3], ids[2]]);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 4);
        assert_eq!(counts.cancelled, 1);
    }

    #[tokio::test]
    async fn huge_offset_returns_an_empty_page() {
        let (_clock, store) = frozen_store();
        store.create(id(), new_task("only", None)).await.unwrap();

        let page = store
            .list(ListFilter {
                status: None,
                limit: usize::MAX,
                offset: usize::MAX,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.tasks.is_empty());
        assert_eq!(sql_count(usize::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn transition_is_conditional_on_current_status() {
        let (clock, store) = frozen_store();
        let task = store.create(id(), new_task("a", None)).await.unwrap();

        assert!(!store.transition(&task.id, TaskUpdate::cancelling()).await.unwrap());
        assert!(store.transition(&task.id, TaskUpdate::claim(clock.now())).await.unwrap());
        assert!(!store.transition(&task.id, TaskUpdate::cancelled(clock.now())).await.unwrap());
        assert!(store.transition(&task.id, TaskUpdate::cancelling()).await.unwrap());

        let got = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Cancelling);
        assert!(got.completed_at.is_none());
    }

    #[tokio::test]
    async fn delete_refuses_running_tasks() {
        let (clock, store) = frozen_store();
        let running = store.create(id(), new_task("a", None)).await.unwrap();
        let pending = store.create(id(), new_task("b", None)).await.unwrap();
        store.transition(&running.id, TaskUpdate::claim(clock.now())).await.unwrap();

        assert_eq!(
            store.delete(&running.id).await.unwrap(),
            DeleteOutcome::Active(TaskStatus::Running)
        );
        assert_eq!(store.delete(&pending.id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete(&pending.id).await.unwrap(), DeleteOutcome::NotFound);
        assert!(store.get(&running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn startup_recovery_resets_running() {
        let (clock, store) = frozen_store();
        let task = store.create(id(), new_task("a", None)).await.unwrap();
        store.transition(&task.id, TaskUpdate::claim(clock.now())).await.unwrap();

        let report = store.reset_running_to_pending().await.unwrap();
        assert_eq!(report.requeued, 1);

        let got = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert!(got.started_at.is_none());
    }

    #[tokio::test]
    async fn notified_flag_persists() {
        let (_clock, store) = frozen_store();
        let task = store.create(id(), new_task("a", None)).await.unwrap();
        assert!(store.update(&task.id, TaskUpdate::notified()).await.unwrap());
        assert!(store.get(&task.id).await.unwrap().unwrap().notified);
        assert!(!store.update(&id(), TaskUpdate::notified()).await.unwrap());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("taskd.db");

        let task = {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.create(id(), new_task("persist me", None)).await.unwrap()
        };

        let reopened = SqliteTaskStore::open(&path).unwrap();
        let got = reopened.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.prompt, "persist me");
    }
}
