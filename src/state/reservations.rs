use super::db::not_found;
use crate::models::{now_ts, Reservation};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, user_id, host_id, session_id, instance_type, cpu, memory_mb, \
     disk_mb, bandwidth_mbps, expires_at, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        host_id: row.get(2)?,
        session_id: row.get(3)?,
        instance_type: row.get(4)?,
        cpu: row.get(5)?,
        memory_mb: row.get(6)?,
        disk_mb: row.get(7)?,
        bandwidth_mbps: row.get(8)?,
        expires_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert(conn: &Connection, r: &Reservation) -> Result<i64> {
    conn.execute(
        "INSERT INTO resource_reservations (user_id, host_id, session_id, instance_type, cpu,
            memory_mb, disk_mb, bandwidth_mbps, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            r.user_id,
            r.host_id,
            r.session_id,
            r.instance_type,
            r.cpu,
            r.memory_mb,
            r.disk_mb,
            r.bandwidth_mbps,
            r.expires_at,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_by_session(conn: &Connection, session_id: &str) -> Result<Reservation> {
    let sql = format!("SELECT {COLUMNS} FROM resource_reservations WHERE session_id = ?1");
    not_found(conn.query_row(&sql, [session_id], from_row), || {
        ControlError::ReservationNotFound(session_id.to_string())
    })
}

pub fn find_by_session(conn: &Connection, session_id: &str) -> Result<Option<Reservation>> {
    let sql = format!("SELECT {COLUMNS} FROM resource_reservations WHERE session_id = ?1");
    Ok(conn.query_row(&sql, [session_id], from_row).optional()?)
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM resource_reservations WHERE id = ?1", [id])?;
    Ok(())
}

pub fn list_expired(conn: &Connection, now: i64) -> Result<Vec<Reservation>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM resource_reservations WHERE expires_at <= ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([now], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn list_active_where(
    conn: &Connection,
    filter: &str,
    arg: i64,
    now: i64,
) -> Result<Vec<Reservation>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM resource_reservations WHERE {filter} AND expires_at > ?2 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![arg, now], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_active_by_user(conn: &Connection, user_id: i64, now: i64) -> Result<Vec<Reservation>> {
    list_active_where(conn, "user_id = ?1", user_id, now)
}

pub fn list_active_by_host(conn: &Connection, host_id: i64, now: i64) -> Result<Vec<Reservation>> {
    list_active_where(conn, "host_id = ?1", host_id, now)
}
