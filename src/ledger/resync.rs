use super::quota_weight;
use crate::state::hosts::HostDelta;
use crate::state::{hosts, instances, reservations, users};
use crate::Result;
use rusqlite::Connection;

/// Counters a host should carry given its resource-holding instances and active reservations.
pub(crate) fn computed_usage(conn: &Connection, host_id: i64, now: i64) -> Result<HostDelta> {
    let held = instances::usage_by_host(conn, host_id)?;
    let mut usage = HostDelta {
        cpu: held.vm_cpu,
        memory_mb: held.memory_mb,
        disk_mb: held.disk_mb,
        containers: held.container_count,
        vms: held.vm_count,
    };
    for r in reservations::list_active_by_host(conn, host_id, now)? {
        let delta = HostDelta::allocation(r.instance_type, r.cpu, r.memory_mb, r.disk_mb);
        usage.cpu += delta.cpu;
        usage.memory_mb += delta.memory_mb;
        usage.disk_mb += delta.disk_mb;
        usage.containers += delta.containers;
        usage.vms += delta.vms;
    }
    Ok(usage)
}

/// Overwrite a host's counters with the computed usage.
pub(crate) fn sync_host_in(conn: &Connection, host_id: i64, now: i64) -> Result<HostDelta> {
    hosts::get(conn, host_id)?;
    let usage = computed_usage(conn, host_id, now)?;
    hosts::set_usage(conn, host_id, usage)?;
    tracing::info!(
        host_id,
        cpu = usage.cpu,
        memory_mb = usage.memory_mb,
        disk_mb = usage.disk_mb,
        containers = usage.containers,
        vms = usage.vms,
        "同步节点资源占用"
    );
    Ok(usage)
}

/// Recompute a user's weighted quota usage the same way.
pub(crate) fn recalculate_user_in(conn: &Connection, user_id: i64, now: i64) -> Result<i64> {
    users::get(conn, user_id)?;
    let mut used = instances::weighted_quota_by_user(conn, user_id)?;
    used += reservations::list_active_by_user(conn, user_id, now)?
        .iter()
        .map(|r| quota_weight(r.cpu, r.memory_mb, r.disk_mb))
        .sum::<i64>();
    users::set_quota(conn, user_id, used)?;
    tracing::info!(user_id, used_quota = used, "重新计算用户配额");
    Ok(used)
}
