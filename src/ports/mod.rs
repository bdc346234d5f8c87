//! Host port allocation and the port-mapping rows that back instance forwards.

pub mod allocator;

pub use allocator::{parse_listening_ports, probe_listening_ports, PortAllocator};

use crate::models::{Host, HostType, NetworkType, PortMapping, PortStatus, Protocol};
use crate::state::ports::NewPortMapping;
use crate::state::{hosts, instances, ports, StateDatabase};
use crate::{ControlError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;

const DEFAULT_PORT_COUNT: i64 = 10;
const SSH_GUEST_PORT: u16 = 22;

/// A user-requested mapping. `host_port == None` asks the allocator to pick one.
#[derive(Debug, Clone)]
pub struct PortRequest {
    pub instance_id: i64,
    pub host_id: i64,
    pub host_port: Option<u16>,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub description: String,
}

/// Per-host port usage.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortUsage {
    pub host_id: i64,
    pub range_start: u16,
    pub range_end: u16,
    pub total_ports: u32,
    pub active_mappings: i64,
    pub next_available_port: u16,
}

/// Whether a host accepts IPv4 port mappings at all.
pub fn check_ipv4_mappings_allowed(host: &Host) -> Result<()> {
    match host.network_type {
        NetworkType::Ipv6Only => Err(ControlError::InvalidParam(
            "纯IPv6模式下不允许IPv4端口映射".to_string(),
        )),
        NetworkType::DedicatedIpv4 | NetworkType::DedicatedIpv4Ipv6 => Err(
            ControlError::InvalidParam("独立IP模式下不需要端口映射".to_string()),
        ),
        NetworkType::NatIpv4 | NetworkType::NatIpv4Ipv6 => Ok(()),
    }
}

fn ipv6_enabled(host: &Host) -> bool {
    host.network_type.has_ipv6()
}

/// Port-mapping engine. Every mutation runs in one write transaction so the host's
/// `next_available_port` and the set of active host ports move together.
#[derive(Clone)]
pub struct PortEngine {
    db: StateDatabase,
}

impl PortEngine {
    pub fn new(db: StateDatabase) -> Self {
        Self { db }
    }

    /// Create the default mapping set for a freshly created instance: SSH on the first free
    /// port of the range, then 1:1 mappings on the following free ports. Hosts that give
    /// instances their own addresses get nothing. `occupied` holds ports found bound on the
    /// host outside of any mapping.
    pub fn allocate_default(
        &self,
        instance_id: i64,
        host_id: i64,
        occupied: &HashSet<u16>,
    ) -> Result<Vec<PortMapping>> {
        self.db
            .write(|tx| allocate_default_in(tx, instance_id, host_id, occupied))
    }

    /// Add one mapping and return its id.
    pub fn add(&self, req: &PortRequest, occupied: &HashSet<u16>) -> Result<i64> {
        self.db.write(|tx| add_in(tx, req, occupied))
    }

    /// Delete a mapping row. Returns the removed row, or `None` when it had already vanished.
    pub fn remove(&self, port_id: i64) -> Result<Option<PortMapping>> {
        self.db.write(|tx| {
            let Some(mapping) = ports::find(tx, port_id)? else {
                return Ok(None);
            };
            ports::delete(tx, port_id)?;
            rewind_next_port(tx, mapping.host_id, &[mapping.host_port])?;
            Ok(Some(mapping))
        })
    }

    pub fn list(&self, instance_id: i64) -> Result<Vec<PortMapping>> {
        self.db.read(|conn| ports::list_by_instance(conn, instance_id))
    }

    pub fn list_by_host(&self, host_id: i64) -> Result<Vec<PortMapping>> {
        self.db.read(|conn| ports::list_by_host(conn, host_id))
    }

    /// Delete all mappings of an instance.
    pub fn release_instance(&self, instance_id: i64) -> Result<usize> {
        self.db.write(|tx| release_instance_ports(tx, instance_id))
    }

    pub fn mark_failed(&self, port_id: i64) -> Result<()> {
        self.db
            .write(|tx| ports::set_status(tx, port_id, PortStatus::Failed))
    }

    pub fn usage(&self, host_id: i64) -> Result<PortUsage> {
        self.db.read(|conn| {
            let host = hosts::get(conn, host_id)?;
            Ok(PortUsage {
                host_id,
                range_start: host.port_range_start,
                range_end: host.port_range_end,
                total_ports: PortAllocator::new(host.port_range_start, host.port_range_end)
                    .range_size(),
                active_mappings: ports::count_active(conn, host_id)?,
                next_available_port: host.next_available_port,
            })
        })
    }
}

pub(crate) fn allocate_default_in(
    conn: &Connection,
    instance_id: i64,
    host_id: i64,
    occupied: &HashSet<u16>,
) -> Result<Vec<PortMapping>> {
    let host = hosts::get(conn, host_id)?;
    if host.network_type.skips_default_mappings() {
        tracing::info!(
            instance_id,
            host = %host.name,
            network_type = %host.network_type,
            "独立IP模式或纯IPv6模式，跳过默认端口映射创建"
        );
        return Ok(Vec::new());
    }

    let allocator = PortAllocator::new(host.port_range_start, host.port_range_end);
    if allocator.range_size() == 0 {
        return Err(ControlError::InvalidParam(format!(
            "invalid port range {}-{} on host {}",
            host.port_range_start, host.port_range_end, host.name
        )));
    }
    let wanted = if host.default_port_count <= 0 {
        DEFAULT_PORT_COUNT
    } else {
        host.default_port_count
    };
    let wanted = wanted.min(i64::from(allocator.range_size()));

    let mut taken = ports::active_host_ports(conn, host_id)?;
    taken.extend(occupied.iter().copied());

    let ssh_port = allocator
        .next_free_forward(host.port_range_start, |p| taken.contains(&p))
        .ok_or(ControlError::NoPortsAvailable {
            start: host.port_range_start,
            end: host.port_range_end,
        })?;

    let mut created = Vec::new();
    let ssh_id = ports::insert(
        conn,
        &NewPortMapping {
            instance_id,
            host_id,
            host_port: ssh_port,
            guest_port: SSH_GUEST_PORT,
            protocol: Protocol::Both,
            description: "SSH".to_string(),
            is_ssh: true,
            is_automatic: true,
            ipv6_enabled: ipv6_enabled(&host),
            mapping_method: host.ipv4_port_mapping_method,
        },
    )?;
    taken.insert(ssh_port);
    instances::set_ssh_port(conn, instance_id, ssh_port)?;
    created.push(ports::get(conn, ssh_id)?);

    let mut last = ssh_port;
    let mut cursor = ssh_port.checked_add(1);
    while (created.len() as i64) < wanted {
        let Some(from) = cursor else { break };
        let Some(port) = allocator.next_free_forward(from, |p| taken.contains(&p)) else {
            break;
        };
        let id = ports::insert(
            conn,
            &NewPortMapping {
                instance_id,
                host_id,
                host_port: port,
                guest_port: port,
                protocol: Protocol::Both,
                description: format!("端口{port}"),
                is_ssh: false,
                is_automatic: true,
                ipv6_enabled: ipv6_enabled(&host),
                mapping_method: host.ipv4_port_mapping_method,
            },
        )?;
        taken.insert(port);
        created.push(ports::get(conn, id)?);
        last = port;
        cursor = port.checked_add(1);
    }

    if last >= host.next_available_port || !allocator.contains(host.next_available_port) {
        hosts::set_next_port(conn, host_id, allocator.after(last))?;
    }

    tracing::info!(
        instance_id,
        host = %host.name,
        total_ports = created.len(),
        ssh_port,
        "创建默认端口映射成功"
    );
    Ok(created)
}

pub(crate) fn add_in(
    conn: &Connection,
    req: &PortRequest,
    occupied: &HashSet<u16>,
) -> Result<i64> {
    let host = hosts::get(conn, req.host_id)?;
    check_ipv4_mappings_allowed(&host)?;
    if host.host_type == HostType::Docker {
        return Err(ControlError::InvalidParam(
            "手动添加端口仅支持 LXD/Incus/Proxmox".to_string(),
        ));
    }
    let instance = instances::get(conn, req.instance_id)?;
    if instance.host_id != host.id {
        return Err(ControlError::InvalidParam(format!(
            "instance {} does not belong to host {}",
            instance.id, host.name
        )));
    }
    if req.guest_port == 0 {
        return Err(ControlError::InvalidParam("guest port must be 1-65535".to_string()));
    }

    let allocator = PortAllocator::new(host.port_range_start, host.port_range_end);
    let mut taken = ports::active_host_ports(conn, host.id)?;
    let host_port = match req.host_port.filter(|p| *p != 0) {
        Some(port) => {
            if port < host.port_range_start || port > host.port_range_end {
                return Err(ControlError::InvalidParam(format!(
                    "端口 {port} 不在节点端口范围 {}-{} 内",
                    host.port_range_start, host.port_range_end
                )));
            }
            if taken.contains(&port) || occupied.contains(&port) {
                return Err(ControlError::InvalidParam(format!("端口 {port} 已被占用")));
            }
            port
        }
        None => {
            taken.extend(occupied.iter().copied());
            let port = allocator
                .next_free(host.next_available_port, |p| taken.contains(&p))
                .ok_or(ControlError::NoPortsAvailable {
                    start: host.port_range_start,
                    end: host.port_range_end,
                })?;
            hosts::set_next_port(conn, host.id, allocator.after(port))?;
            port
        }
    };

    let id = ports::insert(
        conn,
        &NewPortMapping {
            instance_id: req.instance_id,
            host_id: host.id,
            host_port,
            guest_port: req.guest_port,
            protocol: req.protocol,
            description: req.description.clone(),
            is_ssh: req.guest_port == SSH_GUEST_PORT,
            is_automatic: false,
            ipv6_enabled: host.network_type == NetworkType::NatIpv4Ipv6,
            mapping_method: host.ipv4_port_mapping_method,
        },
    )?;
    tracing::info!(
        port_id = id,
        instance_id = req.instance_id,
        host_port,
        guest_port = req.guest_port,
        "端口映射记录已创建"
    );
    Ok(id)
}

/// Delete every mapping of an instance and move the host cursor back so the freed ports are
/// handed out first.
pub(crate) fn release_instance_ports(conn: &Connection, instance_id: i64) -> Result<usize> {
    let mappings = ports::list_by_instance(conn, instance_id)?;
    let removed = ports::delete_by_instance(conn, instance_id)?;
    let mut by_host: Vec<(i64, Vec<u16>)> = Vec::new();
    for m in &mappings {
        match by_host.iter_mut().find(|(h, _)| *h == m.host_id) {
            Some((_, list)) => list.push(m.host_port),
            None => by_host.push((m.host_id, vec![m.host_port])),
        }
    }
    for (host_id, released) in by_host {
        if let Err(err) = rewind_next_port(conn, host_id, &released) {
            tracing::warn!(host_id, error = %err, "优化端口重用失败");
        }
    }
    if removed > 0 {
        tracing::info!(instance_id, released = removed, "删除实例端口映射成功");
    }
    Ok(removed)
}

fn rewind_next_port(conn: &Connection, host_id: i64, released: &[u16]) -> Result<()> {
    let host = hosts::get(conn, host_id)?;
    let allocator = PortAllocator::new(host.port_range_start, host.port_range_end);
    let lowest = released.iter().copied().filter(|p| allocator.contains(*p)).min();
    if let Some(port) = lowest {
        if port < host.next_available_port {
            hosts::set_next_port(conn, host_id, port)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod ports_tests;
