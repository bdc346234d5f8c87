use super::db::not_found;
use crate::models::{now_ts, Task, TaskStatus, TaskType};
use crate::{ControlError, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;

const COLUMNS: &str = "id, uuid, user_id, host_id, instance_id, task_type, status, task_data, \
     progress, status_message, error_message, cancel_reason, timeout_duration_s, \
     is_force_stoppable, created_at, started_at, completed_at, updated_at";

const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed', 'cancelled', 'timeout')";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        uuid: row.get(1)?,
        user_id: row.get(2)?,
        host_id: row.get(3)?,
        instance_id: row.get(4)?,
        task_type: row.get(5)?,
        status: row.get(6)?,
        task_data: row.get(7)?,
        progress: row.get(8)?,
        status_message: row.get(9)?,
        error_message: row.get(10)?,
        cancel_reason: row.get(11)?,
        timeout_duration_s: row.get(12)?,
        is_force_stoppable: row.get(13)?,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: i64,
    pub host_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: TaskType,
    pub task_data: String,
    pub timeout_duration_s: i64,
    pub is_force_stoppable: bool,
}

impl NewTask {
    pub fn new(user_id: i64, task_type: TaskType, task_data: String) -> Self {
        Self {
            user_id,
            host_id: None,
            instance_id: None,
            task_type,
            task_data,
            timeout_duration_s: task_type.default_timeout_secs(),
            is_force_stoppable: task_type.is_force_stoppable(),
        }
    }
}

/// Insert a pending task and return the stored row.
pub fn insert(conn: &Connection, task: &NewTask) -> Result<Task> {
    let now = now_ts();
    let uuid = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tasks (uuid, user_id, host_id, instance_id, task_type, status, task_data,
            progress, status_message, timeout_duration_s, is_force_stoppable, created_at,
            updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '', ?8, ?9, ?10, ?10)",
        params![
            uuid,
            task.user_id,
            task.host_id,
            task.instance_id,
            task.task_type,
            TaskStatus::Pending,
            task.task_data,
            task.timeout_duration_s,
            task.is_force_stoppable,
            now
        ],
    )?;
    get(conn, conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Task> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::TaskNotFound(id.to_string())
    })
}

pub fn get_by_uuid(conn: &Connection, uuid: &str) -> Result<Task> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE uuid = ?1");
    not_found(conn.query_row(&sql, [uuid], from_row), || {
        ControlError::TaskNotFound(uuid.to_string())
    })
}

/// Filters for task listing. `page` is 1-based.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<i64>,
    pub host_id: Option<i64>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub page: u32,
    pub page_size: u32,
}

pub fn list(conn: &Connection, filter: &TaskFilter) -> Result<(Vec<Task>, i64)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(user_id) = filter.user_id {
        args.push(Box::new(user_id));
        clauses.push(format!("user_id = ?{}", args.len()));
    }
    if let Some(host_id) = filter.host_id {
        args.push(Box::new(host_id));
        clauses.push(format!("host_id = ?{}", args.len()));
    }
    if let Some(task_type) = filter.task_type {
        args.push(Box::new(task_type));
        clauses.push(format!("task_type = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(Box::new(status));
        clauses.push(format!("status = ?{}", args.len()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let arg_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
        arg_refs.as_slice(),
        |row| row.get(0),
    )?;

    let page_size = if filter.page_size == 0 {
        20
    } else {
        filter.page_size.min(100)
    };
    let offset = filter.page.max(1).saturating_sub(1) * page_size;
    let sql = format!(
        "SELECT {COLUMNS} FROM tasks {where_sql} ORDER BY created_at DESC, id DESC
         LIMIT {page_size} OFFSET {offset}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(arg_refs.as_slice(), from_row)?;
    Ok((rows.collect::<rusqlite::Result<Vec<_>>>()?, total))
}

pub fn list_by_status(conn: &Connection, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {COLUMNS} FROM tasks WHERE status IN ({}) ORDER BY created_at, id",
        placeholders.join(", ")
    );
    let args: Vec<&dyn ToSql> = statuses.iter().map(|s| s as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args.as_slice(), from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Non-terminal tasks targeting an instance.
pub fn count_open_for_instance(conn: &Connection, instance_id: i64) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM tasks WHERE instance_id = ?1 AND {NOT_TERMINAL}");
    Ok(conn.query_row(&sql, [instance_id], |row| row.get(0))?)
}

pub fn count_by_status_for_host(
    conn: &Connection,
    host_id: i64,
) -> Result<HashMap<TaskStatus, i64>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE host_id = ?1 GROUP BY status")?;
    let rows = stmt.query_map([host_id], |row| {
        Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

pub fn stats(conn: &Connection) -> Result<Vec<(TaskStatus, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `pending -> running`. Returns false if the task was no longer pending.
pub fn mark_running(conn: &Connection, id: i64) -> Result<bool> {
    let now = now_ts();
    let affected = conn.execute(
        "UPDATE tasks SET status = ?2, started_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id, TaskStatus::Running, now],
    )?;
    Ok(affected == 1)
}

pub fn set_status(conn: &Connection, id: i64, status: TaskStatus) -> Result<()> {
    if status.is_terminal() {
        return Err(ControlError::Internal(format!(
            "terminal status {status} must be written through finish()"
        )));
    }
    // A cancelling task keeps its status until the worker finishes it.
    conn.execute(
        "UPDATE tasks SET status = ?2, updated_at = ?3
         WHERE id = ?1 AND status IN ('running', 'processing')",
        params![id, status, now_ts()],
    )?;
    Ok(())
}

pub fn set_instance(conn: &Connection, id: i64, instance_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET instance_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, instance_id, now_ts()],
    )?;
    Ok(())
}

/// Record progress on a non-terminal task. Progress never moves backwards.
pub fn update_progress(conn: &Connection, id: i64, progress: u8, message: &str) -> Result<()> {
    let sql = format!(
        "UPDATE tasks SET progress = MAX(progress, ?2), status_message = ?3, updated_at = ?4
         WHERE id = ?1 AND {NOT_TERMINAL}"
    );
    conn.execute(&sql, params![id, progress.min(100), message, now_ts()])?;
    Ok(())
}

pub fn set_cancelling(conn: &Connection, id: i64, reason: &str) -> Result<bool> {
    let sql = format!(
        "UPDATE tasks SET status = ?2, cancel_reason = ?3, updated_at = ?4
         WHERE id = ?1 AND {NOT_TERMINAL}"
    );
    let affected = conn.execute(&sql, params![id, TaskStatus::Cancelling, reason, now_ts()])?;
    Ok(affected == 1)
}

/// Move a task to a terminal status. A task that is already terminal is left untouched and
/// false is returned.
pub fn finish(
    conn: &Connection,
    id: i64,
    status: TaskStatus,
    message: &str,
    error: Option<&str>,
) -> Result<bool> {
    if !status.is_terminal() {
        return Err(ControlError::InvalidStateTransition {
            from: "active".to_string(),
            to: status.to_string(),
        });
    }
    let now = now_ts();
    let sql = format!(
        "UPDATE tasks SET status = ?2, status_message = ?3, error_message = ?4,
            progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE progress END,
            completed_at = ?5, updated_at = ?5
         WHERE id = ?1 AND {NOT_TERMINAL}"
    );
    let affected = conn.execute(&sql, params![id, status, message, error, now])?;
    Ok(affected == 1)
}

/// Active tasks with no update for longer than their own timeout.
pub fn list_overdue(conn: &Connection, now: i64) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM tasks
         WHERE status IN ('running', 'processing') AND updated_at + timeout_duration_s < ?1
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([now], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_stale_cancelling(conn: &Connection, cutoff: i64) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM tasks WHERE status = 'cancelling' AND updated_at < ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([cutoff], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
