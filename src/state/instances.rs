use super::db::not_found;
use crate::models::{now_ts, Instance, InstanceStatus};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, name, host_id, user_id, image_name, image_url, instance_type, \
     cpu_cores, memory_mb, disk_mb, bandwidth_mbps, status, os_type, username, password, \
     public_ip, private_ip, ipv6_address, public_ipv6, ssh_port, vnstat_interface, \
     traffic_limited, expires_at, created_at, updated_at, deleted_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        host_id: row.get(2)?,
        user_id: row.get(3)?,
        image_name: row.get(4)?,
        image_url: row.get(5)?,
        instance_type: row.get(6)?,
        cpu_cores: row.get(7)?,
        memory_mb: row.get(8)?,
        disk_mb: row.get(9)?,
        bandwidth_mbps: row.get(10)?,
        status: row.get(11)?,
        os_type: row.get(12)?,
        username: row.get(13)?,
        password: row.get(14)?,
        public_ip: row.get(15)?,
        private_ip: row.get(16)?,
        ipv6_address: row.get(17)?,
        public_ipv6: row.get(18)?,
        ssh_port: row.get(19)?,
        vnstat_interface: row.get(20)?,
        traffic_limited: row.get(21)?,
        expires_at: row.get(22)?,
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
        deleted_at: row.get(25)?,
    })
}

pub fn insert(conn: &Connection, instance: &Instance) -> Result<i64> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO instances (name, host_id, user_id, image_name, image_url, instance_type,
            cpu_cores, memory_mb, disk_mb, bandwidth_mbps, status, os_type, username, password,
            public_ip, ssh_port, expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?18)",
        params![
            instance.name,
            instance.host_id,
            instance.user_id,
            instance.image_name,
            instance.image_url,
            instance.instance_type,
            instance.cpu_cores,
            instance.memory_mb,
            instance.disk_mb,
            instance.bandwidth_mbps,
            instance.status,
            instance.os_type,
            instance.username,
            instance.password,
            instance.public_ip,
            instance.ssh_port,
            instance.expires_at,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fetch a live (not soft-deleted) instance.
pub fn get(conn: &Connection, id: i64) -> Result<Instance> {
    let sql = format!("SELECT {COLUMNS} FROM instances WHERE id = ?1 AND deleted_at IS NULL");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::InstanceNotFound(id.to_string())
    })
}

/// Fetch an instance even if it has been soft-deleted.
pub fn get_unscoped(conn: &Connection, id: i64) -> Result<Instance> {
    let sql = format!("SELECT {COLUMNS} FROM instances WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::InstanceNotFound(id.to_string())
    })
}

pub fn name_exists(conn: &Connection, host_id: i64, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM instances WHERE host_id = ?1 AND name = ?2 AND deleted_at IS NULL",
            params![host_id, name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn query_list(conn: &Connection, filter: &str, arg: i64) -> Result<Vec<Instance>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM instances WHERE {filter} AND deleted_at IS NULL ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([arg], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_by_user(conn: &Connection, user_id: i64) -> Result<Vec<Instance>> {
    query_list(conn, "user_id = ?1", user_id)
}

pub fn list_by_host(conn: &Connection, host_id: i64) -> Result<Vec<Instance>> {
    query_list(conn, "host_id = ?1", host_id)
}

pub fn list_by_status(conn: &Connection, status: InstanceStatus) -> Result<Vec<Instance>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM instances WHERE status = ?1 AND deleted_at IS NULL ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([status], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Ids of every instance a user ever owned, soft-deleted ones included.
pub fn ids_by_user_unscoped(conn: &Connection, user_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM instances WHERE user_id = ?1")?;
    let rows = stmt.query_map([user_id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn ids_by_host_unscoped(conn: &Connection, host_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM instances WHERE host_id = ?1")?;
    let rows = stmt.query_map([host_id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_status(conn: &Connection, id: i64, status: InstanceStatus) -> Result<()> {
    let affected = conn.execute(
        "UPDATE instances SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status, now_ts()],
    )?;
    if affected == 0 {
        return Err(ControlError::InstanceNotFound(id.to_string()));
    }
    Ok(())
}

/// Addresses learned from the hypervisor after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceAddresses {
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub ipv6_address: Option<String>,
    pub public_ipv6: Option<String>,
}

pub fn set_addresses(conn: &Connection, id: i64, addrs: &InstanceAddresses) -> Result<()> {
    conn.execute(
        "UPDATE instances SET
            public_ip = COALESCE(?2, public_ip),
            private_ip = COALESCE(?3, private_ip),
            ipv6_address = COALESCE(?4, ipv6_address),
            public_ipv6 = COALESCE(?5, public_ipv6),
            updated_at = ?6
         WHERE id = ?1",
        params![
            id,
            addrs.public_ip,
            addrs.private_ip,
            addrs.ipv6_address,
            addrs.public_ipv6,
            now_ts()
        ],
    )?;
    Ok(())
}

pub fn set_password(conn: &Connection, id: i64, password: &str) -> Result<()> {
    conn.execute(
        "UPDATE instances SET password = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, password, now_ts()],
    )?;
    Ok(())
}

pub fn set_ssh_port(conn: &Connection, id: i64, port: u16) -> Result<()> {
    conn.execute(
        "UPDATE instances SET ssh_port = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, port, now_ts()],
    )?;
    Ok(())
}

pub fn set_vnstat_interface(conn: &Connection, id: i64, interface: &str) -> Result<()> {
    conn.execute(
        "UPDATE instances SET vnstat_interface = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, interface, now_ts()],
    )?;
    Ok(())
}

pub fn set_traffic_limited(conn: &Connection, id: i64, limited: bool) -> Result<()> {
    conn.execute(
        "UPDATE instances SET traffic_limited = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, limited, now_ts()],
    )?;
    Ok(())
}

/// Mark the instance deleted while keeping the row for traffic history.
pub fn soft_delete(conn: &Connection, id: i64) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE instances SET status = ?2, deleted_at = ?3, updated_at = ?3 WHERE id = ?1",
        params![id, InstanceStatus::Deleted, now],
    )?;
    Ok(())
}

/// Resource totals over instances that currently hold host resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub count: i64,
    pub vm_count: i64,
    pub container_count: i64,
    pub cpu: i64,
    pub vm_cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub max_bandwidth: i64,
}

const HOLDING: &str = "status IN ('creating', 'running', 'stopped') AND deleted_at IS NULL";

fn usage(conn: &Connection, filter: &str, arg: i64) -> Result<UsageTotals> {
    let sql = format!(
        "SELECT COUNT(*),
            COALESCE(SUM(CASE WHEN instance_type = 'vm' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN instance_type = 'container' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(cpu_cores), 0),
            COALESCE(SUM(CASE WHEN instance_type = 'vm' THEN cpu_cores ELSE 0 END), 0),
            COALESCE(SUM(memory_mb), 0),
            COALESCE(SUM(disk_mb), 0),
            COALESCE(MAX(bandwidth_mbps), 0)
         FROM instances WHERE {filter} AND {HOLDING}"
    );
    Ok(conn.query_row(&sql, [arg], |row| {
        Ok(UsageTotals {
            count: row.get(0)?,
            vm_count: row.get(1)?,
            container_count: row.get(2)?,
            cpu: row.get(3)?,
            vm_cpu: row.get(4)?,
            memory_mb: row.get(5)?,
            disk_mb: row.get(6)?,
            max_bandwidth: row.get(7)?,
        })
    })?)
}

pub fn usage_by_user(conn: &Connection, user_id: i64) -> Result<UsageTotals> {
    usage(conn, "user_id = ?1", user_id)
}

pub fn usage_by_host(conn: &Connection, host_id: i64) -> Result<UsageTotals> {
    usage(conn, "host_id = ?1", host_id)
}

/// Weighted quota of the user's resource-holding instances.
pub fn weighted_quota_by_user(conn: &Connection, user_id: i64) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(SUM(cpu_cores * 4 + (memory_mb / 512) * 2 + disk_mb / 5), 0)
         FROM instances WHERE user_id = ?1 AND {HOLDING}"
    );
    Ok(conn.query_row(&sql, [user_id], |row| row.get(0))?)
}
