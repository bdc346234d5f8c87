//! Entry point for callers: admission of create requests, instance actions, port mappings,
//! task queries and cancellation, host administration and the background loops.

use crate::config::ControlConfig;
use crate::context::OpContext;
use crate::images::ImageManager;
use crate::ledger::{self, ResourceLedger, ResourceRequest};
use crate::models::{
    now_ts, CreatePortMappingData, CreateTaskData, DeletePortMappingData, Host, Image, Instance,
    InstanceActionData, InstanceStatus, PortMapping, Protocol, Task, TaskStatus, TaskType, User,
};
use crate::ports::{
    check_ipv4_mappings_allowed, probe_listening_ports, PortEngine, PortRequest, PortUsage,
};
use crate::registry::{spawn_health_scheduler, ProviderRegistry, ShellFactory, SshShellFactory};
use crate::state::hosts::HostDelta;
use crate::state::tasks::{NewTask, TaskFilter};
use crate::state::{hosts, images, instances, ports, tasks, users, StateDatabase};
use crate::tasks::{spawn_reaper, RecoveryReport, TaskManager};
use crate::traffic::{spawn_traffic_sync, SyncReport, TrafficAggregator};
use crate::{ControlError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A user's request for a new instance. Resources are named by catalog id.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub provider_id: i64,
    pub image_id: i64,
    pub cpu_id: String,
    pub memory_id: String,
    pub disk_id: String,
    pub bandwidth_id: String,
    pub description: String,
}

string_enum! {
    /// Power and lifecycle actions a user can request on an instance.
    pub enum InstanceAction {
        Start => "start",
        Stop => "stop",
        Restart => "restart",
        Delete => "delete",
        Reset => "reset",
    }
}

impl InstanceAction {
    fn task_type(self) -> TaskType {
        match self {
            InstanceAction::Start => TaskType::Start,
            InstanceAction::Stop => TaskType::Stop,
            InstanceAction::Restart => TaskType::Restart,
            InstanceAction::Delete => TaskType::Delete,
            InstanceAction::Reset => TaskType::Reset,
        }
    }

    fn allowed_from(self, status: InstanceStatus) -> bool {
        match self {
            InstanceAction::Start => status.can_start(),
            InstanceAction::Stop | InstanceAction::Restart => status.can_stop(),
            InstanceAction::Delete => status.can_delete(),
            InstanceAction::Reset => {
                matches!(status, InstanceStatus::Running | InstanceStatus::Stopped)
            }
        }
    }
}

/// A user-requested extra port mapping.
#[derive(Debug, Clone)]
pub struct AddPortRequest {
    pub instance_id: i64,
    pub host_port: Option<u16>,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub description: String,
}

/// A task row plus what the caller may do with it right now.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub can_cancel: bool,
    pub can_force_stop: bool,
    pub remaining_secs: Option<i64>,
}

impl TaskView {
    fn new(task: Task, now: i64) -> Self {
        Self {
            can_cancel: task.can_cancel(),
            can_force_stop: task.can_force_stop(),
            remaining_secs: task.remaining_secs(now),
            task,
        }
    }
}

/// Who is asking. Administrators bypass ownership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    User(i64),
    Admin,
}

impl Caller {
    fn owns(&self, user_id: i64) -> bool {
        match self {
            Caller::User(id) => *id == user_id,
            Caller::Admin => true,
        }
    }

    fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

/// The control plane. Cheap to clone; every clone shares the same pools and caches.
#[derive(Clone)]
pub struct ControlService {
    db: StateDatabase,
    config: Arc<ControlConfig>,
    registry: Arc<ProviderRegistry>,
    ledger: ResourceLedger,
    ports: PortEngine,
    tasks: TaskManager,
    traffic: TrafficAggregator,
}

impl ControlService {
    /// Service driving hosts over password SSH.
    pub fn new(db: StateDatabase, config: Arc<ControlConfig>) -> Self {
        let shells = Arc::new(SshShellFactory::new(config.clone()));
        Self::with_shells(db, config, shells)
    }

    /// Service with a custom way of reaching hosts.
    pub fn with_shells(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        shells: Arc<dyn ShellFactory>,
    ) -> Self {
        let images = Arc::new(ImageManager::new(config.cdn.clone()));
        let registry = Arc::new(ProviderRegistry::new(
            db.clone(),
            config.clone(),
            images,
            shells,
        ));
        let tasks = TaskManager::new(db.clone(), config.clone(), registry.clone());
        Self::assemble(db, config, registry, tasks)
    }

    /// Service around an existing task manager.
    pub fn from_parts(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        registry: Arc<ProviderRegistry>,
        tasks: TaskManager,
    ) -> Self {
        Self::assemble(db, config, registry, tasks)
    }

    fn assemble(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        registry: Arc<ProviderRegistry>,
        tasks: TaskManager,
    ) -> Self {
        Self {
            ledger: ResourceLedger::new(db.clone(), config.clone()),
            ports: PortEngine::new(db.clone()),
            traffic: TrafficAggregator::new(db.clone(), config.clone(), tasks.clone()),
            db,
            config,
            registry,
            tasks,
        }
    }

    pub fn db(&self) -> &StateDatabase {
        &self.db
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn instance_for(&self, caller: Caller, instance_id: i64) -> Result<Instance> {
        let instance = self.db.read(|conn| instances::get(conn, instance_id))?;
        if !caller.owns(instance.user_id) {
            return Err(ControlError::PermissionDenied(format!(
                "instance {instance_id} belongs to another user"
            )));
        }
        Ok(instance)
    }

    fn ensure_idle(&self, instance: &Instance) -> Result<()> {
        let open = self
            .db
            .read(|conn| tasks::count_open_for_instance(conn, instance.id))?;
        if open > 0 {
            return Err(ControlError::InvalidParam(format!(
                "instance {} already has a task in progress",
                instance.name
            )));
        }
        Ok(())
    }

    fn new_instance_task<T: Serialize>(
        &self,
        instance: &Instance,
        task_type: TaskType,
        data: &T,
    ) -> Result<NewTask> {
        let mut new = NewTask::new(instance.user_id, task_type, serde_json::to_string(data)?);
        new.host_id = Some(instance.host_id);
        new.instance_id = Some(instance.id);
        Ok(new)
    }

    // ---- instances ----

    /// Admit a create request and queue its task. Quota, host capacity and host concurrency
    /// are checked in the same transaction that writes the reservation and the task, so a
    /// rejected request leaves no rows behind.
    pub fn create_instance(&self, user_id: i64, req: &CreateRequest) -> Result<Task> {
        let specs = &self.config.specs;
        let cpu = specs.cpu(&req.cpu_id)?;
        let memory_mb = specs.memory(&req.memory_id)?;
        let disk_mb = specs.disk(&req.disk_id)?;
        let bandwidth_mbps = specs.bandwidth(&req.bandwidth_id)?;

        let (host, image) = self.db.read(|conn| {
            Ok((
                hosts::get(conn, req.provider_id)?,
                images::get(conn, req.image_id)?,
            ))
        })?;
        image.check_host(&host)?;
        if let Some(reason) = host.unavailable_reason(now_ts()) {
            return Err(ControlError::HostUnavailable(reason));
        }

        let request = ResourceRequest {
            user_id,
            host_id: host.id,
            instance_type: image.instance_type,
            cpu,
            memory_mb,
            disk_mb,
            bandwidth_mbps,
        };
        let ttl = self.config.reservation_ttl_secs as i64;
        let task = self.db.write(|tx| {
            let reservation = ledger::reserve_in(tx, &self.config, &request, ttl)?;
            let data = CreateTaskData {
                provider_id: host.id,
                image_id: image.id,
                cpu_id: req.cpu_id.clone(),
                memory_id: req.memory_id.clone(),
                disk_id: req.disk_id.clone(),
                bandwidth_id: req.bandwidth_id.clone(),
                session_id: reservation.session_id,
                description: req.description.clone(),
            };
            let mut new = NewTask::new(user_id, TaskType::Create, serde_json::to_string(&data)?);
            new.host_id = Some(host.id);
            tasks::insert(tx, &new)
        })?;
        tracing::info!(
            task_id = task.id,
            user_id,
            host = %host.name,
            image = %image.name,
            cpu,
            memory_mb,
            disk_mb,
            "创建实例任务已提交"
        );

        // A task left pending here is picked up again by startup recovery.
        if let Err(err) = self.tasks.enqueue(&task) {
            tracing::error!(task_id = task.id, error = %err, "任务入队失败");
        }
        Ok(task)
    }

    /// Queue a power or lifecycle action. Users may only act on their own instances, and only
    /// one task per instance may be open at a time.
    pub fn instance_action(
        &self,
        caller: Caller,
        instance_id: i64,
        action: InstanceAction,
    ) -> Result<Task> {
        let instance = self.instance_for(caller, instance_id)?;
        if !action.allowed_from(instance.status) {
            return Err(ControlError::InvalidStateTransition {
                from: instance.status.to_string(),
                to: action.to_string(),
            });
        }
        if action == InstanceAction::Start && instance.traffic_limited && !caller.is_admin() {
            return Err(ControlError::QuotaExceeded(format!(
                "instance {} is stopped for exceeding its monthly traffic",
                instance.name
            )));
        }
        self.ensure_idle(&instance)?;

        let data = InstanceActionData {
            instance_id,
            admin: caller.is_admin(),
            traffic_control: false,
        };
        let task = self
            .tasks
            .submit(self.new_instance_task(&instance, action.task_type(), &data)?)?;
        tracing::info!(task_id = task.id, instance = %instance.name, %action, "实例操作任务已提交");
        Ok(task)
    }

    pub fn reset_password(&self, caller: Caller, instance_id: i64) -> Result<Task> {
        let instance = self.instance_for(caller, instance_id)?;
        if instance.status != InstanceStatus::Running {
            return Err(ControlError::InvalidParam(format!(
                "instance {} must be running to reset its password",
                instance.name
            )));
        }
        self.ensure_idle(&instance)?;
        let data = InstanceActionData {
            instance_id,
            admin: caller.is_admin(),
            traffic_control: false,
        };
        self.tasks
            .submit(self.new_instance_task(&instance, TaskType::ResetPassword, &data)?)
    }

    pub fn list_instances(&self, user_id: i64) -> Result<Vec<Instance>> {
        self.db.read(|conn| instances::list_by_user(conn, user_id))
    }

    // ---- port mappings ----

    /// Reserve a host port for a user mapping and queue the task that installs its rule.
    pub async fn add_port_mapping(&self, caller: Caller, req: &AddPortRequest) -> Result<Task> {
        let instance = self.instance_for(caller, req.instance_id)?;
        if instance.status != InstanceStatus::Running {
            return Err(ControlError::InvalidParam(format!(
                "instance {} must be running to add a port mapping",
                instance.name
            )));
        }
        let host = self.db.read(|conn| hosts::get(conn, instance.host_id))?;
        check_ipv4_mappings_allowed(&host)?;
        if host.host_type == crate::models::HostType::Docker {
            return Err(ControlError::InvalidParam(
                "Docker实例的端口映射只能在创建时指定".to_string(),
            ));
        }

        let ctx = OpContext::background().with_timeout(Duration::from_secs(30));
        let occupied = match self.registry.shell(host.id) {
            Ok(shell) => probe_listening_ports(shell.as_ref(), &ctx).await,
            Err(err) => {
                tracing::warn!(host = %host.name, error = %err, "无法探测节点端口占用");
                Default::default()
            }
        };
        let port_id = self.ports.add(
            &PortRequest {
                instance_id: instance.id,
                host_id: host.id,
                host_port: req.host_port,
                guest_port: req.guest_port,
                protocol: req.protocol,
                description: req.description.clone(),
            },
            &occupied,
        )?;

        let data = CreatePortMappingData {
            instance_id: instance.id,
            port_id,
        };
        let submitted = self
            .new_instance_task(&instance, TaskType::CreatePortMapping, &data)
            .and_then(|new| self.tasks.submit(new));
        match submitted {
            Ok(task) => Ok(task),
            Err(err) => {
                self.ports.remove(port_id)?;
                Err(err)
            }
        }
    }

    /// Queue removal of a user mapping. The default mappings made at creation stay for the
    /// life of the instance.
    pub fn remove_port_mapping(&self, caller: Caller, port_id: i64) -> Result<Task> {
        let mapping = self.db.read(|conn| ports::get(conn, port_id))?;
        let instance = self.instance_for(caller, mapping.instance_id)?;
        if mapping.is_automatic {
            return Err(ControlError::InvalidParam(
                "默认端口映射不能删除".to_string(),
            ));
        }
        let data = DeletePortMappingData {
            instance_id: instance.id,
            port_id,
            host_port: mapping.host_port,
            guest_port: mapping.guest_port,
            protocol: mapping.protocol,
        };
        self.tasks
            .submit(self.new_instance_task(&instance, TaskType::DeletePortMapping, &data)?)
    }

    pub fn list_port_mappings(&self, caller: Caller, instance_id: i64) -> Result<Vec<PortMapping>> {
        let instance = self.instance_for(caller, instance_id)?;
        self.ports.list(instance.id)
    }

    pub fn port_usage(&self, host_id: i64) -> Result<PortUsage> {
        self.ports.usage(host_id)
    }

    // ---- tasks ----

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<(Vec<TaskView>, i64)> {
        let (rows, total) = self.db.read(|conn| tasks::list(conn, filter))?;
        let now = now_ts();
        Ok((rows.into_iter().map(|t| TaskView::new(t, now)).collect(), total))
    }

    pub fn get_task(&self, caller: Caller, task_id: i64) -> Result<TaskView> {
        let task = self.db.read(|conn| tasks::get(conn, task_id))?;
        if !caller.owns(task.user_id) {
            return Err(ControlError::PermissionDenied(format!(
                "task {task_id} belongs to another user"
            )));
        }
        Ok(TaskView::new(task, now_ts()))
    }

    /// User cancellation of their own task.
    pub fn cancel_task(&self, caller: Caller, task_id: i64, reason: &str) -> Result<TaskView> {
        self.get_task(caller, task_id)?;
        let task = self.tasks.cancel(task_id, reason)?;
        Ok(TaskView::new(task, now_ts()))
    }

    /// Administrator force-stop.
    pub fn force_cancel_task(&self, task_id: i64, reason: &str) -> Result<TaskView> {
        let task = self.tasks.force_cancel(task_id, reason)?;
        Ok(TaskView::new(task, now_ts()))
    }

    pub fn task_stats(&self) -> Result<Vec<(TaskStatus, i64)>> {
        self.db.read(tasks::stats)
    }

    // ---- hosts, users, images ----

    pub fn add_host(&self, host: &Host) -> Result<i64> {
        if host.port_range_start == 0 || host.port_range_start > host.port_range_end {
            return Err(ControlError::InvalidParam(format!(
                "invalid port range {}-{}",
                host.port_range_start, host.port_range_end
            )));
        }
        let id = self.db.write(|tx| hosts::insert(tx, host))?;
        tracing::info!(host = %host.name, host_type = %host.host_type, id, "节点已添加");
        Ok(id)
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        self.db.read(hosts::list)
    }

    pub async fn set_host_frozen(&self, host_id: i64, frozen: bool) -> Result<()> {
        self.registry.set_frozen(host_id, frozen).await
    }

    /// Drop a host that carries no live instances.
    pub async fn remove_host(&self, host_id: i64) -> Result<()> {
        let live = self.db.read(|conn| instances::list_by_host(conn, host_id))?;
        if live.iter().any(|i| i.status.holds_resources()) {
            return Err(ControlError::InvalidParam(format!(
                "host {host_id} still carries {} instances",
                live.len()
            )));
        }
        self.registry.remove_host(host_id).await
    }

    /// Recompute a host's counters from its instances and live reservations.
    pub fn resync_host(&self, host_id: i64) -> Result<HostDelta> {
        self.ledger.sync_host_resources(host_id)
    }

    pub fn add_user(&self, username: &str, level: i64, total_traffic_mb: i64) -> Result<i64> {
        self.db
            .write(|tx| users::insert(tx, username, level, 0, total_traffic_mb))
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.read(users::list)
    }

    pub fn recalculate_user_quota(&self, user_id: i64) -> Result<i64> {
        self.ledger.recalculate_user_quota(user_id)
    }

    pub fn add_image(&self, image: &Image) -> Result<i64> {
        if image.url.is_empty() {
            return Err(ControlError::InvalidParam(format!(
                "image {} has no download url",
                image.name
            )));
        }
        self.db.write(|tx| images::insert(tx, image))
    }

    pub fn list_images(&self) -> Result<Vec<Image>> {
        self.db.read(images::list)
    }

    pub fn sync_traffic(&self) -> Result<SyncReport> {
        self.traffic.sync_all()
    }

    // ---- lifecycle ----

    /// Recover interrupted work, then start the reaper, health probe, reservation sweeper and
    /// traffic sync. Everything stops when `token` is cancelled.
    pub fn start_background(&self, token: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let report: RecoveryReport = self.tasks.recover()?;
        tracing::info!(
            interrupted = report.interrupted,
            requeued = report.requeued,
            swept = report.reservations_swept,
            "任务恢复完成"
        );

        Ok(vec![
            spawn_reaper(self.tasks.clone(), token.clone()),
            spawn_health_scheduler(
                self.registry.clone(),
                Duration::from_secs(self.config.health_interval_secs.max(1)),
                token.clone(),
            ),
            spawn_reservation_sweeper(
                self.ledger.clone(),
                Duration::from_secs(self.config.reservation_sweep_interval_secs.max(1)),
                token.clone(),
            ),
            spawn_traffic_sync(self.traffic.clone(), token),
        ])
    }

    /// Stop accepting tasks, let running ones finish or interrupt them, and close host
    /// sessions.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        if let Err(err) = self.registry.disconnect_all().await {
            tracing::warn!(error = %err, "断开节点连接失败");
        }
        tracing::info!("控制面已停止");
    }
}

fn spawn_reservation_sweeper(
    ledger: ResourceLedger,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = ledger.sweep_expired() {
                tracing::error!(error = %err, "清理过期资源预留失败");
            }
        }
    })
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod service_tests;
