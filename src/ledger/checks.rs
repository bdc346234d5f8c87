use super::ResourceRequest;
use crate::config::QuotaConfig;
use crate::models::{Host, InstanceType, TaskStatus, User};
use crate::state::{instances, reservations, tasks};
use crate::{ControlError, Result};
use rusqlite::Connection;

/// Check the request against the limits of the user's level. Usage counts resource-holding
/// instances plus reservations that have not expired yet.
pub fn check_user_quota(
    conn: &Connection,
    quota: &QuotaConfig,
    user: &User,
    req: &ResourceRequest,
    now: i64,
) -> Result<()> {
    if !quota.allows_instance_type(user.id, user.level, req.instance_type) {
        return Err(ControlError::PermissionDenied(format!(
            "level {} may not create {} instances",
            user.level, req.instance_type
        )));
    }
    if user.traffic_limited {
        return Err(ControlError::QuotaExceeded(
            "monthly traffic exhausted".to_string(),
        ));
    }

    let limits = quota.limits_for(user.level);
    let held = instances::usage_by_user(conn, user.id)?;
    let pending = reservations::list_active_by_user(conn, user.id, now)?;

    let count = held.count + pending.len() as i64;
    let cpu = held.cpu + pending.iter().map(|r| r.cpu).sum::<i64>();
    let memory = held.memory_mb + pending.iter().map(|r| r.memory_mb).sum::<i64>();
    let disk = held.disk_mb + pending.iter().map(|r| r.disk_mb).sum::<i64>();

    if count >= limits.max_instances {
        return Err(ControlError::QuotaExceeded(format!(
            "instance limit reached: {count}/{}",
            limits.max_instances
        )));
    }
    if cpu + req.cpu > limits.max_cpu {
        return Err(ControlError::QuotaExceeded(format!(
            "CPU resource not enough: need {}, used {cpu}, max {}",
            req.cpu, limits.max_cpu
        )));
    }
    if memory + req.memory_mb > limits.max_memory {
        return Err(ControlError::QuotaExceeded(format!(
            "memory resource not enough: need {}MB, used {memory}MB, max {}MB",
            req.memory_mb, limits.max_memory
        )));
    }
    if disk + req.disk_mb > limits.max_disk {
        return Err(ControlError::QuotaExceeded(format!(
            "disk resource not enough: need {}MB, used {disk}MB, max {}MB",
            req.disk_mb, limits.max_disk
        )));
    }
    if req.bandwidth_mbps > limits.max_bandwidth {
        return Err(ControlError::QuotaExceeded(format!(
            "bandwidth exceeds level limit: need {}Mbps, level {} allows {}Mbps",
            req.bandwidth_mbps, user.level, limits.max_bandwidth
        )));
    }
    if user.total_quota > 0 && user.used_quota + req.weight() > user.total_quota {
        return Err(ControlError::QuotaExceeded(format!(
            "quota units not enough: need {}, used {}, total {}",
            req.weight(),
            user.used_quota,
            user.total_quota
        )));
    }
    Ok(())
}

/// Check the host can take the instance. Containers share CPU, so only VMs are gated on
/// cores; memory and disk are never over-committed.
pub fn check_host_capacity(host: &Host, req: &ResourceRequest, now: i64) -> Result<()> {
    if let Some(reason) = host.unavailable_reason(now) {
        return Err(ControlError::HostUnavailable(reason));
    }
    match req.instance_type {
        InstanceType::Container => {
            if !host.container_enabled {
                return Err(ControlError::HostUnavailable(format!(
                    "host {} does not support containers",
                    host.name
                )));
            }
            if host.max_container_instances > 0
                && host.container_count >= host.max_container_instances
            {
                return Err(ControlError::HostCapacityExceeded(format!(
                    "container limit reached: {}/{}",
                    host.container_count, host.max_container_instances
                )));
            }
        }
        InstanceType::Vm => {
            if !host.vm_enabled {
                return Err(ControlError::HostUnavailable(format!(
                    "host {} does not support virtual machines",
                    host.name
                )));
            }
            let available = host.node_cpu_cores - host.used_cpu_cores;
            if req.cpu > available {
                return Err(ControlError::HostCapacityExceeded(format!(
                    "CPU not enough: need {} cores, {available} available",
                    req.cpu
                )));
            }
            if host.max_vm_instances > 0 && host.vm_count >= host.max_vm_instances {
                return Err(ControlError::HostCapacityExceeded(format!(
                    "VM limit reached: {}/{}",
                    host.vm_count, host.max_vm_instances
                )));
            }
        }
    }

    let memory = host.node_memory_mb - host.used_memory_mb;
    if req.memory_mb > memory {
        return Err(ControlError::HostCapacityExceeded(format!(
            "memory not enough: need {}MB, {memory}MB available",
            req.memory_mb
        )));
    }
    let disk = host.node_disk_mb - host.used_disk_mb;
    if req.disk_mb > disk {
        return Err(ControlError::HostCapacityExceeded(format!(
            "disk not enough: need {}MB, {disk}MB available",
            req.disk_mb
        )));
    }
    Ok(())
}

/// Refuse new work while the host runs as many tasks as it allows. Pending tasks queue
/// without limit.
pub fn check_concurrency(conn: &Connection, host: &Host) -> Result<()> {
    let counts = tasks::count_by_status_for_host(conn, host.id)?;
    let running = [TaskStatus::Running, TaskStatus::Processing]
        .iter()
        .map(|s| counts.get(s).copied().unwrap_or(0))
        .sum::<i64>();
    let limit = if host.allow_concurrent_tasks {
        host.max_concurrent_tasks.max(1)
    } else {
        1
    };
    if running >= limit {
        return Err(ControlError::HostConcurrencyExceeded(format!(
            "host {} is running {running}/{limit} tasks",
            host.name
        )));
    }
    Ok(())
}
