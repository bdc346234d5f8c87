use super::db::not_found;
use crate::models::{now_ts, MappingMethod, PortMapping, PortStatus, Protocol};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

const COLUMNS: &str = "id, instance_id, host_id, host_port, guest_port, protocol, description, \
     is_ssh, is_automatic, ipv6_enabled, status, mapping_method, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<PortMapping> {
    Ok(PortMapping {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        host_id: row.get(2)?,
        host_port: row.get(3)?,
        guest_port: row.get(4)?,
        protocol: row.get(5)?,
        description: row.get(6)?,
        is_ssh: row.get(7)?,
        is_automatic: row.get(8)?,
        ipv6_enabled: row.get(9)?,
        status: row.get(10)?,
        mapping_method: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Fields of a mapping about to be inserted.
#[derive(Debug, Clone)]
pub struct NewPortMapping {
    pub instance_id: i64,
    pub host_id: i64,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub description: String,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub ipv6_enabled: bool,
    pub mapping_method: MappingMethod,
}

pub fn insert(conn: &Connection, mapping: &NewPortMapping) -> Result<i64> {
    conn.execute(
        "INSERT INTO port_mappings (instance_id, host_id, host_port, guest_port, protocol,
            description, is_ssh, is_automatic, ipv6_enabled, status, mapping_method, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            mapping.instance_id,
            mapping.host_id,
            mapping.host_port,
            mapping.guest_port,
            mapping.protocol,
            mapping.description,
            mapping.is_ssh,
            mapping.is_automatic,
            mapping.ipv6_enabled,
            PortStatus::Active,
            mapping.mapping_method,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<PortMapping> {
    let sql = format!("SELECT {COLUMNS} FROM port_mappings WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::PortMappingNotFound(id)
    })
}

pub fn find(conn: &Connection, id: i64) -> Result<Option<PortMapping>> {
    let sql = format!("SELECT {COLUMNS} FROM port_mappings WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], from_row).optional()?)
}

pub fn list_by_instance(conn: &Connection, instance_id: i64) -> Result<Vec<PortMapping>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM port_mappings WHERE instance_id = ?1 ORDER BY is_ssh DESC, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([instance_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_by_host(conn: &Connection, host_id: i64) -> Result<Vec<PortMapping>> {
    let sql = format!("SELECT {COLUMNS} FROM port_mappings WHERE host_id = ?1 ORDER BY host_port");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([host_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Host ports held by active mappings.
pub fn active_host_ports(conn: &Connection, host_id: i64) -> Result<HashSet<u16>> {
    let mut stmt = conn.prepare(
        "SELECT host_port FROM port_mappings WHERE host_id = ?1 AND status = 'active'",
    )?;
    let rows = stmt.query_map([host_id], |row| row.get::<_, u16>(0))?;
    Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
}

pub fn count_active(conn: &Connection, host_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM port_mappings WHERE host_id = ?1 AND status = 'active'",
        [host_id],
        |row| row.get(0),
    )?)
}

pub fn set_status(conn: &Connection, id: i64, status: PortStatus) -> Result<()> {
    conn.execute(
        "UPDATE port_mappings SET status = ?2 WHERE id = ?1",
        params![id, status],
    )?;
    Ok(())
}

/// Delete a mapping. Returns false when the row was already gone.
pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM port_mappings WHERE id = ?1", [id])? > 0)
}

pub fn delete_by_instance(conn: &Connection, instance_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM port_mappings WHERE instance_id = ?1",
        [instance_id],
    )?)
}
