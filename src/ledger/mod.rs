//! Resource accounting: user quota, host capacity and host concurrency, plus the reservations
//! that hold resources between admission and instance creation.

mod checks;
mod resync;

pub use checks::{check_concurrency, check_host_capacity, check_user_quota};

use crate::config::ControlConfig;
use crate::models::{new_session_id, now_ts, Instance, InstanceType, Reservation, UserStatus};
use crate::state::hosts::HostDelta;
use crate::state::{hosts, reservations, users, StateDatabase};
use crate::{ControlError, Result};
use rusqlite::Connection;
use std::sync::Arc;

/// Weighted quota units for an allocation: CPU counts 4, each 512 MB of memory counts 2 and
/// every 5 MB of disk counts 1.
pub fn quota_weight(cpu: i64, memory_mb: i64, disk_mb: i64) -> i64 {
    cpu * 4 + (memory_mb / 512) * 2 + disk_mb / 5
}

/// Resources asked for by one create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub user_id: i64,
    pub host_id: i64,
    pub instance_type: InstanceType,
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub bandwidth_mbps: i64,
}

impl ResourceRequest {
    pub fn weight(&self) -> i64 {
        quota_weight(self.cpu, self.memory_mb, self.disk_mb)
    }

    fn host_delta(&self) -> HostDelta {
        HostDelta::allocation(self.instance_type, self.cpu, self.memory_mb, self.disk_mb)
    }
}

impl From<&Reservation> for ResourceRequest {
    fn from(r: &Reservation) -> Self {
        Self {
            user_id: r.user_id,
            host_id: r.host_id,
            instance_type: r.instance_type,
            cpu: r.cpu,
            memory_mb: r.memory_mb,
            disk_mb: r.disk_mb,
            bandwidth_mbps: r.bandwidth_mbps,
        }
    }
}

impl From<&Instance> for ResourceRequest {
    fn from(i: &Instance) -> Self {
        Self {
            user_id: i.user_id,
            host_id: i.host_id,
            instance_type: i.instance_type,
            cpu: i.cpu_cores,
            memory_mb: i.memory_mb,
            disk_mb: i.disk_mb,
            bandwidth_mbps: i.bandwidth_mbps,
        }
    }
}

/// Charge a request to the host counters and the user's quota.
pub(crate) fn allocate_in(conn: &Connection, req: &ResourceRequest) -> Result<()> {
    hosts::apply_delta(conn, req.host_id, req.host_delta())?;
    users::adjust_quota(conn, req.user_id, req.weight())?;
    Ok(())
}

/// Give back what `allocate_in` charged.
pub(crate) fn release_in(conn: &Connection, req: &ResourceRequest) -> Result<()> {
    hosts::apply_delta(conn, req.host_id, req.host_delta().negate())?;
    users::adjust_quota(conn, req.user_id, -req.weight())?;
    Ok(())
}

/// Run every admission check for `req` against the rows visible to `conn`.
pub(crate) fn validate_in(
    conn: &Connection,
    config: &ControlConfig,
    req: &ResourceRequest,
    now: i64,
) -> Result<()> {
    let user = users::get(conn, req.user_id)?;
    if user.status != UserStatus::Active {
        return Err(ControlError::PermissionDenied(format!(
            "user {} is disabled",
            user.username
        )));
    }
    check_user_quota(conn, &config.quota, &user, req, now)?;

    let host = hosts::get(conn, req.host_id)?;
    check_host_capacity(&host, req, now)?;
    check_concurrency(conn, &host)?;
    Ok(())
}

/// Admission and bookkeeping over the state database.
#[derive(Clone)]
pub struct ResourceLedger {
    db: StateDatabase,
    config: Arc<ControlConfig>,
}

impl ResourceLedger {
    pub fn new(db: StateDatabase, config: Arc<ControlConfig>) -> Self {
        Self { db, config }
    }

    /// Validate quota, capacity and concurrency and hold the resources under a new
    /// reservation, all in one transaction. Nothing is written when a check fails.
    pub fn reserve(&self, req: &ResourceRequest) -> Result<Reservation> {
        let ttl = self.config.reservation_ttl_secs as i64;
        let reservation = self.db.write(|tx| reserve_in(tx, &self.config, req, ttl))?;
        tracing::info!(
            user_id = req.user_id,
            host_id = req.host_id,
            session = %reservation.session_id,
            cpu = req.cpu,
            memory_mb = req.memory_mb,
            disk_mb = req.disk_mb,
            "资源预留成功"
        );
        Ok(reservation)
    }

    /// Drop a reservation that will never be consumed and release what it held.
    pub fn cancel_reservation(&self, session_id: &str) -> Result<()> {
        self.db.write(|tx| {
            let Some(r) = reservations::find_by_session(tx, session_id)? else {
                return Ok(());
            };
            release_in(tx, &ResourceRequest::from(&r))?;
            reservations::delete(tx, r.id)
        })
    }

    /// Release every reservation past its expiry. Returns how many were swept.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = now_ts();
        let swept = self.db.write(|tx| {
            let expired = reservations::list_expired(tx, now)?;
            for r in &expired {
                release_in(tx, &ResourceRequest::from(r))?;
                reservations::delete(tx, r.id)?;
            }
            Ok(expired.len())
        })?;
        if swept > 0 {
            tracing::info!(count = swept, "清理过期资源预留");
        }
        Ok(swept)
    }

    /// Give back resources held by an instance or failed creation.
    pub fn release(&self, req: &ResourceRequest) -> Result<()> {
        self.db.write(|tx| release_in(tx, req))
    }

    pub fn sync_host_resources(&self, host_id: i64) -> Result<HostDelta> {
        self.db.write(|tx| resync::sync_host_in(tx, host_id, now_ts()))
    }

    pub fn recalculate_user_quota(&self, user_id: i64) -> Result<i64> {
        self.db.write(|tx| resync::recalculate_user_in(tx, user_id, now_ts()))
    }
}

pub(crate) fn reserve_in(
    conn: &Connection,
    config: &ControlConfig,
    req: &ResourceRequest,
    ttl_secs: i64,
) -> Result<Reservation> {
    let now = now_ts();
    validate_in(conn, config, req, now)?;

    let mut reservation = Reservation {
        id: 0,
        user_id: req.user_id,
        host_id: req.host_id,
        session_id: new_session_id(),
        instance_type: req.instance_type,
        cpu: req.cpu,
        memory_mb: req.memory_mb,
        disk_mb: req.disk_mb,
        bandwidth_mbps: req.bandwidth_mbps,
        expires_at: now + ttl_secs,
        created_at: now,
    };
    reservation.id = reservations::insert(conn, &reservation)?;
    allocate_in(conn, req)?;
    Ok(reservation)
}

/// Hand a reservation's resources over to the instance being created. The reservation row
/// goes away and its deltas stay charged. When the reservation already expired and was swept,
/// the request is validated and charged again.
pub(crate) fn claim_in(
    conn: &Connection,
    config: &ControlConfig,
    session_id: &str,
    req: &ResourceRequest,
) -> Result<()> {
    match reservations::find_by_session(conn, session_id)? {
        Some(r) => {
            if r.user_id != req.user_id || r.host_id != req.host_id {
                return Err(ControlError::InvalidParam(format!(
                    "reservation {session_id} belongs to another request"
                )));
            }
            reservations::delete(conn, r.id)?;
            let held = ResourceRequest::from(&r);
            if held != *req {
                release_in(conn, &held)?;
                allocate_in(conn, req)?;
            }
            Ok(())
        }
        None => {
            tracing::warn!(session = %session_id, "资源预留已过期，重新校验并分配资源");
            let user = users::get(conn, req.user_id)?;
            check_user_quota(conn, &config.quota, &user, req, now_ts())?;
            let host = hosts::get(conn, req.host_id)?;
            check_host_capacity(&host, req, now_ts())?;
            allocate_in(conn, req)
        }
    }
}
