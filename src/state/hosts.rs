use super::db::not_found;
use crate::models::{now_ts, Host, HostStatus, InstanceType};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, name, host_type, endpoint, ssh_port, ssh_user, ssh_password, \
     api_cert_path, api_key_path, api_token, api_token_id, architecture, region, country, \
     execution_rule, status, allow_claim, is_frozen, expires_at, node_cpu_cores, node_memory_mb, \
     node_disk_mb, used_cpu_cores, used_memory_mb, used_disk_mb, container_count, vm_count, \
     max_container_instances, max_vm_instances, container_enabled, vm_enabled, \
     max_concurrent_tasks, allow_concurrent_tasks, network_type, ipv4_port_mapping_method, \
     ipv6_port_mapping_method, port_range_start, port_range_end, next_available_port, \
     default_port_count, default_in_bandwidth_mbps, default_out_bandwidth_mbps, \
     max_in_bandwidth_mbps, max_out_bandwidth_mbps, max_traffic_mb, used_traffic_mb, \
     traffic_reset_at, traffic_limited, storage_pool, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        host_type: row.get(2)?,
        endpoint: row.get(3)?,
        ssh_port: row.get(4)?,
        ssh_user: row.get(5)?,
        ssh_password: row.get(6)?,
        api_cert_path: row.get(7)?,
        api_key_path: row.get(8)?,
        api_token: row.get(9)?,
        api_token_id: row.get(10)?,
        architecture: row.get(11)?,
        region: row.get(12)?,
        country: row.get(13)?,
        execution_rule: row.get(14)?,
        status: row.get(15)?,
        allow_claim: row.get(16)?,
        is_frozen: row.get(17)?,
        expires_at: row.get(18)?,
        node_cpu_cores: row.get(19)?,
        node_memory_mb: row.get(20)?,
        node_disk_mb: row.get(21)?,
        used_cpu_cores: row.get(22)?,
        used_memory_mb: row.get(23)?,
        used_disk_mb: row.get(24)?,
        container_count: row.get(25)?,
        vm_count: row.get(26)?,
        max_container_instances: row.get(27)?,
        max_vm_instances: row.get(28)?,
        container_enabled: row.get(29)?,
        vm_enabled: row.get(30)?,
        max_concurrent_tasks: row.get(31)?,
        allow_concurrent_tasks: row.get(32)?,
        network_type: row.get(33)?,
        ipv4_port_mapping_method: row.get(34)?,
        ipv6_port_mapping_method: row.get(35)?,
        port_range_start: row.get(36)?,
        port_range_end: row.get(37)?,
        next_available_port: row.get(38)?,
        default_port_count: row.get(39)?,
        default_in_bandwidth_mbps: row.get(40)?,
        default_out_bandwidth_mbps: row.get(41)?,
        max_in_bandwidth_mbps: row.get(42)?,
        max_out_bandwidth_mbps: row.get(43)?,
        max_traffic_mb: row.get(44)?,
        used_traffic_mb: row.get(45)?,
        traffic_reset_at: row.get(46)?,
        traffic_limited: row.get(47)?,
        storage_pool: row.get(48)?,
        created_at: row.get(49)?,
        updated_at: row.get(50)?,
    })
}

/// Insert a host. Usage counters always start at zero.
pub fn insert(conn: &Connection, host: &Host) -> Result<i64> {
    if host.port_range_start == 0 || host.port_range_start > host.port_range_end {
        return Err(ControlError::InvalidParam(format!(
            "invalid port range {}-{}",
            host.port_range_start, host.port_range_end
        )));
    }
    let now = now_ts();
    conn.execute(
        "INSERT INTO hosts (name, host_type, endpoint, ssh_port, ssh_user, ssh_password,
            api_cert_path, api_key_path, api_token, api_token_id, architecture, region, country,
            execution_rule, status, allow_claim, is_frozen, expires_at, node_cpu_cores,
            node_memory_mb, node_disk_mb, max_container_instances, max_vm_instances,
            container_enabled, vm_enabled, max_concurrent_tasks, allow_concurrent_tasks,
            network_type, ipv4_port_mapping_method, ipv6_port_mapping_method, port_range_start,
            port_range_end, next_available_port, default_port_count, default_in_bandwidth_mbps,
            default_out_bandwidth_mbps, max_in_bandwidth_mbps, max_out_bandwidth_mbps,
            max_traffic_mb, traffic_reset_at, storage_pool, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34,
            ?35, ?36, ?37, ?38, ?39, ?40, ?41, ?42, ?42)",
        params![
            host.name,
            host.host_type,
            host.endpoint,
            host.ssh_port,
            host.ssh_user,
            host.ssh_password,
            host.api_cert_path,
            host.api_key_path,
            host.api_token,
            host.api_token_id,
            host.architecture,
            host.region,
            host.country,
            host.execution_rule,
            host.status,
            host.allow_claim,
            host.is_frozen,
            host.expires_at,
            host.node_cpu_cores,
            host.node_memory_mb,
            host.node_disk_mb,
            host.max_container_instances,
            host.max_vm_instances,
            host.container_enabled,
            host.vm_enabled,
            host.max_concurrent_tasks,
            host.allow_concurrent_tasks,
            host.network_type,
            host.ipv4_port_mapping_method,
            host.ipv6_port_mapping_method,
            host.port_range_start,
            host.port_range_end,
            host.port_range_start,
            host.default_port_count,
            host.default_in_bandwidth_mbps,
            host.default_out_bandwidth_mbps,
            host.max_in_bandwidth_mbps,
            host.max_out_bandwidth_mbps,
            host.max_traffic_mb,
            host.traffic_reset_at,
            host.storage_pool,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Host> {
    let sql = format!("SELECT {COLUMNS} FROM hosts WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::HostNotFound(id.to_string())
    })
}

pub fn get_by_name(conn: &Connection, name: &str) -> Result<Host> {
    let sql = format!("SELECT {COLUMNS} FROM hosts WHERE name = ?1");
    not_found(conn.query_row(&sql, [name], from_row), || {
        ControlError::HostNotFound(name.to_string())
    })
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Host>> {
    let sql = format!("SELECT {COLUMNS} FROM hosts WHERE name = ?1");
    Ok(conn.query_row(&sql, [name], from_row).optional()?)
}

pub fn list(conn: &Connection) -> Result<Vec<Host>> {
    let sql = format!("SELECT {COLUMNS} FROM hosts ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    let affected = conn.execute("DELETE FROM hosts WHERE id = ?1", [id])?;
    if affected == 0 {
        return Err(ControlError::HostNotFound(id.to_string()));
    }
    Ok(())
}

/// Signed change applied to a host's usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDelta {
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub containers: i64,
    pub vms: i64,
}

impl HostDelta {
    /// Delta for allocating one instance. CPU is only charged for VMs.
    pub fn allocation(instance_type: InstanceType, cpu: i64, memory_mb: i64, disk_mb: i64) -> Self {
        match instance_type {
            InstanceType::Vm => Self {
                cpu,
                memory_mb,
                disk_mb,
                containers: 0,
                vms: 1,
            },
            InstanceType::Container => Self {
                cpu: 0,
                memory_mb,
                disk_mb,
                containers: 1,
                vms: 0,
            },
        }
    }

    pub fn negate(self) -> Self {
        Self {
            cpu: -self.cpu,
            memory_mb: -self.memory_mb,
            disk_mb: -self.disk_mb,
            containers: -self.containers,
            vms: -self.vms,
        }
    }
}

/// Apply a delta to the usage counters, clamping at zero.
pub fn apply_delta(conn: &Connection, host_id: i64, delta: HostDelta) -> Result<()> {
    let affected = conn.execute(
        "UPDATE hosts SET
            used_cpu_cores = MAX(0, used_cpu_cores + ?2),
            used_memory_mb = MAX(0, used_memory_mb + ?3),
            used_disk_mb = MAX(0, used_disk_mb + ?4),
            container_count = MAX(0, container_count + ?5),
            vm_count = MAX(0, vm_count + ?6),
            updated_at = ?7
         WHERE id = ?1",
        params![
            host_id,
            delta.cpu,
            delta.memory_mb,
            delta.disk_mb,
            delta.containers,
            delta.vms,
            now_ts()
        ],
    )?;
    if affected == 0 {
        return Err(ControlError::HostNotFound(host_id.to_string()));
    }
    Ok(())
}

/// Overwrite usage counters with recomputed totals.
pub fn set_usage(conn: &Connection, host_id: i64, usage: HostDelta) -> Result<()> {
    conn.execute(
        "UPDATE hosts SET used_cpu_cores = ?2, used_memory_mb = ?3, used_disk_mb = ?4,
            container_count = ?5, vm_count = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            host_id,
            usage.cpu.max(0),
            usage.memory_mb.max(0),
            usage.disk_mb.max(0),
            usage.containers.max(0),
            usage.vms.max(0),
            now_ts()
        ],
    )?;
    Ok(())
}

pub fn set_next_port(conn: &Connection, host_id: i64, port: u16) -> Result<()> {
    conn.execute(
        "UPDATE hosts SET next_available_port = ?2, updated_at = ?3 WHERE id = ?1",
        params![host_id, port, now_ts()],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, host_id: i64, status: HostStatus) -> Result<()> {
    conn.execute(
        "UPDATE hosts SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![host_id, status, now_ts()],
    )?;
    Ok(())
}

pub fn set_frozen(conn: &Connection, host_id: i64, frozen: bool) -> Result<()> {
    let affected = conn.execute(
        "UPDATE hosts SET is_frozen = ?2, updated_at = ?3 WHERE id = ?1",
        params![host_id, frozen, now_ts()],
    )?;
    if affected == 0 {
        return Err(ControlError::HostNotFound(host_id.to_string()));
    }
    Ok(())
}

pub fn set_traffic(
    conn: &Connection,
    host_id: i64,
    used_mb: i64,
    limited: bool,
    reset_at: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE hosts SET used_traffic_mb = ?2, traffic_limited = ?3, traffic_reset_at = ?4,
            updated_at = ?5
         WHERE id = ?1",
        params![host_id, used_mb, limited, reset_at, now_ts()],
    )?;
    Ok(())
}
