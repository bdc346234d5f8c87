use crate::models::{now_ts, TrafficRecord, VnstatSample};
use crate::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, user_id, host_id, instance_id, year, month, traffic_in_mb, \
     traffic_out_mb, total_used_mb, interface_name, vnstat_version, last_vnstat_rx_mb, \
     last_vnstat_tx_mb, last_sync_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<TrafficRecord> {
    Ok(TrafficRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        host_id: row.get(2)?,
        instance_id: row.get(3)?,
        year: row.get(4)?,
        month: row.get(5)?,
        traffic_in_mb: row.get(6)?,
        traffic_out_mb: row.get(7)?,
        total_used_mb: row.get(8)?,
        interface_name: row.get(9)?,
        vnstat_version: row.get(10)?,
        last_vnstat_rx_mb: row.get(11)?,
        last_vnstat_tx_mb: row.get(12)?,
        last_sync_at: row.get(13)?,
    })
}

pub fn find(
    conn: &Connection,
    instance_id: i64,
    year: i32,
    month: u32,
) -> Result<Option<TrafficRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM traffic_records WHERE instance_id = ?1 AND year = ?2 AND month = ?3"
    );
    Ok(conn
        .query_row(&sql, params![instance_id, year, month], from_row)
        .optional()?)
}

/// Insert or replace the record for `(instance_id, year, month)`.
pub fn upsert(conn: &Connection, r: &TrafficRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO traffic_records (user_id, host_id, instance_id, year, month, traffic_in_mb,
            traffic_out_mb, total_used_mb, interface_name, vnstat_version, last_vnstat_rx_mb,
            last_vnstat_tx_mb, last_sync_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(instance_id, year, month) DO UPDATE SET
            traffic_in_mb = excluded.traffic_in_mb,
            traffic_out_mb = excluded.traffic_out_mb,
            total_used_mb = excluded.total_used_mb,
            interface_name = excluded.interface_name,
            vnstat_version = excluded.vnstat_version,
            last_vnstat_rx_mb = excluded.last_vnstat_rx_mb,
            last_vnstat_tx_mb = excluded.last_vnstat_tx_mb,
            last_sync_at = excluded.last_sync_at",
        params![
            r.user_id,
            r.host_id,
            r.instance_id,
            r.year,
            r.month,
            r.traffic_in_mb,
            r.traffic_out_mb,
            r.total_used_mb,
            r.interface_name,
            r.vnstat_version,
            r.last_vnstat_rx_mb,
            r.last_vnstat_tx_mb,
            r.last_sync_at
        ],
    )?;
    Ok(())
}

/// Sum of monthly totals across instances owned by a user, soft-deleted instances included.
pub fn user_month_total(conn: &Connection, user_id: i64, year: i32, month: u32) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(total_used_mb), 0) FROM traffic_records
         WHERE user_id = ?1 AND year = ?2 AND month = ?3",
        params![user_id, year, month],
        |row| row.get(0),
    )?)
}

pub fn host_month_total(conn: &Connection, host_id: i64, year: i32, month: u32) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(total_used_mb), 0) FROM traffic_records
         WHERE host_id = ?1 AND year = ?2 AND month = ?3",
        params![host_id, year, month],
        |row| row.get(0),
    )?)
}

pub fn insert_sample(conn: &Connection, s: &VnstatSample) -> Result<i64> {
    conn.execute(
        "INSERT INTO vnstat_traffic_records (instance_id, interface, year, month, day, hour,
            rx_bytes, tx_bytes, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            s.instance_id,
            s.interface,
            s.year,
            s.month,
            s.day,
            s.hour,
            s.rx_bytes,
            s.tx_bytes,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Monthly rollup bytes per interface for one instance, using each interface's latest sample.
pub fn monthly_rollups(
    conn: &Connection,
    instance_id: i64,
    year: i32,
    month: u32,
) -> Result<Vec<(String, i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT v.interface, v.rx_bytes, v.tx_bytes FROM vnstat_traffic_records v
         WHERE v.instance_id = ?1 AND v.year = ?2 AND v.month = ?3 AND v.day = 0 AND v.hour = 0
           AND v.id = (SELECT MAX(id) FROM vnstat_traffic_records w
                       WHERE w.instance_id = v.instance_id AND w.interface = v.interface
                         AND w.year = v.year AND w.month = v.month AND w.day = 0 AND w.hour = 0)
         ORDER BY v.interface",
    )?;
    let rows = stmt.query_map(params![instance_id, year, month], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
