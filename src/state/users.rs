use super::db::not_found;
use crate::models::{now_ts, User, UserStatus};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, Row};

const COLUMNS: &str = "id, username, level, status, used_quota, total_quota, total_traffic_mb, \
     used_traffic_mb, traffic_reset_at, traffic_limited, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        level: row.get(2)?,
        status: row.get(3)?,
        used_quota: row.get(4)?,
        total_quota: row.get(5)?,
        total_traffic_mb: row.get(6)?,
        used_traffic_mb: row.get(7)?,
        traffic_reset_at: row.get(8)?,
        traffic_limited: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert(
    conn: &Connection,
    username: &str,
    level: i64,
    total_quota: i64,
    total_traffic_mb: i64,
) -> Result<i64> {
    if level < 1 {
        return Err(ControlError::InvalidParam(format!("invalid user level {level}")));
    }
    conn.execute(
        "INSERT INTO users (username, level, status, total_quota, total_traffic_mb, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            username,
            level,
            UserStatus::Active,
            total_quota,
            total_traffic_mb,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<User> {
    let sql = format!("SELECT {COLUMNS} FROM users WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::UserNotFound(id.to_string())
    })
}

pub fn list(conn: &Connection) -> Result<Vec<User>> {
    let sql = format!("SELECT {COLUMNS} FROM users ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_status(conn: &Connection, id: i64, status: UserStatus) -> Result<()> {
    conn.execute(
        "UPDATE users SET status = ?2 WHERE id = ?1",
        params![id, status],
    )?;
    Ok(())
}

/// Add `delta` to `used_quota`, never going below zero.
pub fn adjust_quota(conn: &Connection, id: i64, delta: i64) -> Result<()> {
    let affected = conn.execute(
        "UPDATE users SET used_quota = MAX(0, used_quota + ?2) WHERE id = ?1",
        params![id, delta],
    )?;
    if affected == 0 {
        return Err(ControlError::UserNotFound(id.to_string()));
    }
    Ok(())
}

pub fn set_quota(conn: &Connection, id: i64, used_quota: i64) -> Result<()> {
    conn.execute(
        "UPDATE users SET used_quota = ?2 WHERE id = ?1",
        params![id, used_quota.max(0)],
    )?;
    Ok(())
}

pub fn set_traffic(
    conn: &Connection,
    id: i64,
    used_mb: i64,
    limited: bool,
    reset_at: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE users SET used_traffic_mb = ?2, traffic_limited = ?3, traffic_reset_at = ?4
         WHERE id = ?1",
        params![id, used_mb, limited, reset_at],
    )?;
    Ok(())
}
