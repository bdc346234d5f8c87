use super::{month_of, next_reset_at, sync_instance_at};
use crate::config::ControlConfig;
use crate::models::{
    now_ts, Host, Instance, InstanceActionData, InstanceStatus, TaskType, User, UserStatus,
};
use crate::state::tasks::NewTask;
use crate::state::{hosts, instances, tasks, traffic, users, StateDatabase};
use crate::tasks::TaskManager;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What one aggregation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub instances_synced: usize,
    pub stop_tasks: usize,
    pub start_tasks: usize,
    pub resets: usize,
}

/// Whose traffic budget a pass is looking at.
#[derive(Debug, Clone, Copy)]
enum Owner {
    User(i64),
    Host(i64),
}

/// Accounting state shared by users and hosts.
struct Budget {
    owner: Owner,
    used_mb: i64,
    limit_mb: i64,
    limited: bool,
    reset_at: Option<i64>,
}

impl Budget {
    fn for_user(user: &User, config: &ControlConfig) -> Self {
        let limit_mb = if user.total_traffic_mb > 0 {
            user.total_traffic_mb
        } else {
            config.quota.limits_for(user.level).max_traffic
        };
        Self {
            owner: Owner::User(user.id),
            used_mb: user.used_traffic_mb,
            limit_mb,
            limited: user.traffic_limited,
            reset_at: user.traffic_reset_at,
        }
    }

    fn for_host(host: &Host) -> Self {
        Self {
            owner: Owner::Host(host.id),
            used_mb: host.used_traffic_mb,
            limit_mb: host.max_traffic_mb,
            limited: host.traffic_limited,
            reset_at: host.traffic_reset_at,
        }
    }
}

/// Rolls up monthly usage, enforces limits through stop tasks and resumes instances after a
/// reset through start tasks.
#[derive(Clone)]
pub struct TrafficAggregator {
    db: StateDatabase,
    config: Arc<ControlConfig>,
    tasks: TaskManager,
}

impl TrafficAggregator {
    pub fn new(db: StateDatabase, config: Arc<ControlConfig>, tasks: TaskManager) -> Self {
        Self { db, config, tasks }
    }

    pub fn sync_all(&self) -> Result<SyncReport> {
        self.sync_all_at(now_ts())
    }

    /// One full pass as of `now`.
    pub fn sync_all_at(&self, now: i64) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let running = self
            .db
            .read(|conn| instances::list_by_status(conn, InstanceStatus::Running))?;
        for instance in &running {
            match sync_instance_at(&self.db, instance.id, now) {
                Ok(Some(_)) => report.instances_synced += 1,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(instance = %instance.name, error = %err, "同步实例流量失败")
                }
            }
        }

        for user in self.db.read(users::list)? {
            if user.status != UserStatus::Active {
                continue;
            }
            let budget = Budget::for_user(&user, &self.config);
            if let Err(err) = self.enforce(budget, now, &mut report) {
                tracing::error!(user_id = user.id, error = %err, "检查用户流量限制失败");
            }
        }
        for host in self.db.read(hosts::list)? {
            if let Err(err) = self.enforce(Budget::for_host(&host), now, &mut report) {
                tracing::error!(host = %host.name, error = %err, "检查节点流量限制失败");
            }
        }

        tracing::debug!(
            synced = report.instances_synced,
            stops = report.stop_tasks,
            starts = report.start_tasks,
            resets = report.resets,
            "流量数据同步完成"
        );
        Ok(report)
    }

    fn enforce(&self, mut budget: Budget, now: i64, report: &mut SyncReport) -> Result<()> {
        let was_limited = budget.limited;
        match budget.reset_at {
            Some(at) if now > at => {
                budget.limited = false;
                budget.reset_at = Some(next_reset_at(now));
                report.resets += 1;
                tracing::info!(owner = ?budget.owner, "月度流量已重置");
            }
            None => budget.reset_at = Some(next_reset_at(now)),
            Some(_) => {}
        }

        let (year, month) = month_of(now);
        budget.used_mb = self.db.read(|conn| match budget.owner {
            Owner::User(id) => traffic::user_month_total(conn, id, year, month),
            Owner::Host(id) => traffic::host_month_total(conn, id, year, month),
        })?;
        budget.limited = budget.limit_mb > 0 && budget.used_mb >= budget.limit_mb;

        self.db.write(|tx| match budget.owner {
            Owner::User(id) => {
                users::set_traffic(tx, id, budget.used_mb, budget.limited, budget.reset_at)
            }
            Owner::Host(id) => {
                hosts::set_traffic(tx, id, budget.used_mb, budget.limited, budget.reset_at)
            }
        })?;

        if budget.limited {
            if !was_limited {
                tracing::warn!(
                    owner = ?budget.owner,
                    used_mb = budget.used_mb,
                    limit_mb = budget.limit_mb,
                    "流量超限，停止实例"
                );
            }
            report.stop_tasks += self.stop_running(budget.owner)?;
        } else if was_limited {
            tracing::info!(owner = ?budget.owner, used_mb = budget.used_mb, "流量限制已解除");
            report.start_tasks += self.resume_stopped(budget.owner)?;
        }
        Ok(())
    }

    fn instances_of(&self, owner: Owner) -> Result<Vec<Instance>> {
        self.db.read(|conn| match owner {
            Owner::User(id) => instances::list_by_user(conn, id),
            Owner::Host(id) => instances::list_by_host(conn, id),
        })
    }

    fn stop_running(&self, owner: Owner) -> Result<usize> {
        let mut queued = 0;
        for instance in self.instances_of(owner)? {
            if instance.status == InstanceStatus::Running
                && self.submit(&instance, TaskType::Stop)?
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Start instances stopped for traffic, unless the other side of the budget still holds
    /// them back.
    fn resume_stopped(&self, owner: Owner) -> Result<usize> {
        let mut queued = 0;
        for instance in self.instances_of(owner)? {
            if instance.status != InstanceStatus::Stopped || !instance.traffic_limited {
                continue;
            }
            let still_limited = self.db.read(|conn| {
                Ok(match owner {
                    Owner::User(_) => hosts::get(conn, instance.host_id)?.traffic_limited,
                    Owner::Host(_) => users::get(conn, instance.user_id)?.traffic_limited,
                })
            })?;
            if !still_limited && self.submit(&instance, TaskType::Start)? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queue a traffic-control action unless the instance already has work in flight.
    fn submit(&self, instance: &Instance, task_type: TaskType) -> Result<bool> {
        let open = self
            .db
            .read(|conn| tasks::count_open_for_instance(conn, instance.id))?;
        if open > 0 {
            return Ok(false);
        }
        let data = InstanceActionData {
            instance_id: instance.id,
            admin: true,
            traffic_control: true,
        };
        let mut new = NewTask::new(instance.user_id, task_type, serde_json::to_string(&data)?);
        new.host_id = Some(instance.host_id);
        new.instance_id = Some(instance.id);
        let task = self.tasks.submit(new)?;
        tracing::info!(
            instance = %instance.name,
            task_id = task.id,
            task_type = %task_type,
            "已提交流量控制任务"
        );
        Ok(true)
    }
}

/// Run `sync_all` every `traffic_sync_interval_secs` until `token` fires.
pub fn spawn_traffic_sync(
    aggregator: TrafficAggregator,
    token: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(aggregator.config.traffic_sync_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pass = aggregator.clone();
            match tokio::task::spawn_blocking(move || pass.sync_all()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::error!(error = %err, "同步流量数据失败"),
                Err(err) => tracing::error!(error = %err, "流量同步任务异常退出"),
            }
        }
        tracing::debug!("流量同步已停止");
    })
}
