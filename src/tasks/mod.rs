//! Asynchronous task pipeline. Every task runs on a worker of its host's pool under a context
//! carrying the task's deadline, and always ends in exactly one terminal status.

mod create;
mod lifecycle;
mod pool;
mod port_tasks;
mod progress;
mod reaper;
mod reset;

pub use progress::Progress;
pub use reaper::{spawn_reaper, RecoveryReport};

use crate::config::ControlConfig;
use crate::context::OpContext;
use crate::ledger::ResourceLedger;
use crate::models::{Task, TaskStatus, TaskType};
use crate::ports::PortEngine;
use crate::registry::ProviderRegistry;
use crate::state::tasks::NewTask;
use crate::state::{hosts, tasks, StateDatabase};
use crate::{ControlError, Result};
use pool::HostPool;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const PASSWORD_LEN: usize = 12;

/// How long interrupted tasks get to record their terminal status at shutdown.
const SHUTDOWN_FINAL_GRACE: Duration = Duration::from_secs(5);

/// Random password with at least one lower-case letter, one upper-case letter and one digit.
/// Look-alike characters are left out.
pub fn generate_password(len: usize) -> String {
    const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
    const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"23456789";

    let mut rng = rand::thread_rng();
    let mut pick = |set: &[u8]| set[rng.gen_range(0..set.len())];
    let mut chars = vec![pick(LOWER), pick(UPPER), pick(DIGITS)];
    let all = [LOWER, UPPER, DIGITS].concat();
    while chars.len() < len.max(3) {
        chars.push(pick(&all));
    }
    chars.shuffle(&mut rand::thread_rng());
    chars.into_iter().map(char::from).collect()
}

fn random_suffix() -> String {
    format!("{:04x}", rand::random::<u16>())
}

/// Submits tasks, runs them and tracks the ones in flight.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    db: StateDatabase,
    config: Arc<ControlConfig>,
    registry: Arc<ProviderRegistry>,
    ledger: ResourceLedger,
    ports: PortEngine,
    /// Cancelled at shutdown; workers stop taking new tasks.
    accepting: CancellationToken,
    /// Parent of every task context.
    root: CancellationToken,
    pools: Mutex<HashMap<i64, HostPool>>,
    running: Mutex<HashMap<i64, OpContext>>,
    suffix: fn() -> String,
}

impl TaskManager {
    pub fn new(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self::with_name_suffix(db, config, registry, random_suffix)
    }

    /// Like `new`, with a custom source for the random part of instance names.
    pub fn with_name_suffix(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        registry: Arc<ProviderRegistry>,
        suffix: fn() -> String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger: ResourceLedger::new(db.clone(), config.clone()),
                ports: PortEngine::new(db.clone()),
                db,
                config,
                registry,
                accepting: CancellationToken::new(),
                root: CancellationToken::new(),
                pools: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                suffix,
            }),
        }
    }

    pub(crate) fn db(&self) -> &StateDatabase {
        &self.inner.db
    }

    pub(crate) fn config(&self) -> &ControlConfig {
        &self.inner.config
    }

    pub(crate) fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub(crate) fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    pub(crate) fn ports(&self) -> &PortEngine {
        &self.inner.ports
    }

    pub(crate) fn progress(&self, task_id: i64) -> Progress {
        Progress::new(self.inner.db.clone(), task_id)
    }

    /// Context for work that outlives its task, such as delayed cleanup.
    pub(crate) fn detached_context(&self, timeout: Duration) -> OpContext {
        OpContext::from_token(self.inner.root.child_token()).with_timeout(timeout)
    }

    fn pools(&self) -> Result<MutexGuard<'_, HashMap<i64, HostPool>>> {
        self.inner
            .pools
            .lock()
            .map_err(|_| ControlError::Internal("task pool lock poisoned".to_string()))
    }

    fn running(&self) -> Result<MutexGuard<'_, HashMap<i64, OpContext>>> {
        self.inner
            .running
            .lock()
            .map_err(|_| ControlError::Internal("running task lock poisoned".to_string()))
    }

    /// Insert a task and queue it on its host.
    pub fn submit(&self, new: NewTask) -> Result<Task> {
        let task = self.inner.db.write(|tx| tasks::insert(tx, &new))?;
        self.enqueue(&task)?;
        Ok(task)
    }

    /// Queue an already persisted pending task on its host's pool.
    pub fn enqueue(&self, task: &Task) -> Result<()> {
        if self.inner.accepting.is_cancelled() {
            return Err(ControlError::Internal(
                "task manager is shutting down".to_string(),
            ));
        }
        let host_id = task
            .host_id
            .ok_or_else(|| ControlError::InvalidParam(format!("task {} has no host", task.id)))?;

        let mut pools = self.pools()?;
        if !pools.contains_key(&host_id) {
            let host = self.inner.db.read(|conn| hosts::get(conn, host_id))?;
            let size = host.pool_size(self.inner.config.tasks.system_concurrency_cap);
            let pool = HostPool::spawn(self.clone(), host_id, size, self.inner.accepting.clone());
            tracing::info!(host = %host.name, workers = pool.size(), "创建节点任务池");
            pools.insert(host_id, pool);
        }
        let queued = pools.get(&host_id).map(|p| p.push(task.id)).unwrap_or(false);
        if !queued {
            return Err(ControlError::Internal(format!(
                "task pool for host {host_id} is closed"
            )));
        }
        tracing::debug!(task_id = task.id, task_type = %task.task_type, host_id, "任务已入队");
        Ok(())
    }

    /// Claim and run one queued task. Called by pool workers.
    async fn execute(&self, task_id: i64) {
        let claimed = match self.inner.db.write(|tx| tasks::mark_running(tx, task_id)) {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::error!(task_id, error = %err, "领取任务失败");
                return;
            }
        };
        if !claimed {
            tracing::debug!(task_id, "任务已不在等待状态，跳过");
            return;
        }
        let task = match self.inner.db.read(|conn| tasks::get(conn, task_id)) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(task_id, error = %err, "读取任务失败");
                return;
            }
        };

        let timeout = Duration::from_secs(task.timeout_duration_s.max(1) as u64);
        let ctx = OpContext::from_token(self.inner.root.child_token()).with_timeout(timeout);
        if let Ok(mut running) = self.running() {
            running.insert(task_id, ctx.clone());
        }
        tracing::info!(task_id, task_type = %task.task_type, user_id = task.user_id, "开始执行任务");

        let handle = tokio::spawn({
            let manager = self.clone();
            let task = task.clone();
            let ctx = ctx.clone();
            async move { manager.dispatch(&task, &ctx).await }
        });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(ControlError::Internal(format!(
                "task handler panicked: {err}"
            ))),
            Err(err) => Err(ControlError::Internal(err.to_string())),
        };

        if let Ok(mut running) = self.running() {
            running.remove(&task_id);
        }
        self.record_outcome(&task, &ctx, outcome);
    }

    fn record_outcome(&self, task: &Task, ctx: &OpContext, outcome: Result<String>) {
        let (status, message, error) = match outcome {
            Ok(message) => (TaskStatus::Completed, message, None),
            Err(err) if ctx.is_cancelled() => {
                (TaskStatus::Cancelled, "任务已取消".to_string(), Some(err.to_string()))
            }
            Err(err) if ctx.is_done() => (
                TaskStatus::Timeout,
                format!(
                    "Task timeout - exceeded {} minutes",
                    task.timeout_duration_s / 60
                ),
                Some(err.to_string()),
            ),
            Err(err) => (TaskStatus::Failed, "任务执行失败".to_string(), Some(err.to_string())),
        };

        match self
            .inner
            .db
            .write(|tx| tasks::finish(tx, task.id, status, &message, error.as_deref()))
        {
            Ok(true) => match status {
                TaskStatus::Completed => {
                    tracing::info!(task_id = task.id, task_type = %task.task_type, "任务执行完成")
                }
                _ => tracing::warn!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    %status,
                    error = error.as_deref().unwrap_or_default(),
                    "任务未成功完成"
                ),
            },
            Ok(false) => tracing::debug!(task_id = task.id, "任务已被其他流程终结"),
            Err(err) => tracing::error!(task_id = task.id, error = %err, "写入任务结果失败"),
        }

        // A create that did not complete must not leave its instance in `creating`.
        if status != TaskStatus::Completed && task.task_type == TaskType::Create {
            let latest = self
                .inner
                .db
                .read(|conn| tasks::get(conn, task.id))
                .unwrap_or_else(|_| task.clone());
            self.release_holds(&latest);
        }
    }

    async fn dispatch(&self, task: &Task, ctx: &OpContext) -> Result<String> {
        match task.task_type {
            TaskType::Create => create::run(self, task, ctx).await,
            TaskType::Start | TaskType::Stop | TaskType::Restart => {
                lifecycle::run_power(self, task, ctx).await
            }
            TaskType::Delete => lifecycle::run_delete(self, task, ctx).await,
            TaskType::Reset => reset::run_reset(self, task, ctx).await,
            TaskType::ResetPassword => reset::run_reset_password(self, task, ctx).await,
            TaskType::CreatePortMapping => port_tasks::run_create(self, task, ctx).await,
            TaskType::DeletePortMapping => port_tasks::run_delete(self, task, ctx).await,
        }
    }

    /// Interrupt the worker running `task_id`, if any. Returns whether one was found.
    fn signal(&self, task_id: i64) -> bool {
        match self.running() {
            Ok(running) => running.get(&task_id).map(|ctx| ctx.cancel()).is_some(),
            Err(_) => false,
        }
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.running()
            .map(|running| running.contains_key(&task_id))
            .unwrap_or(false)
    }

    /// User cancellation. Pending tasks end at once; running ones move to `cancelling` and their
    /// worker finishes them after cleanup.
    pub fn cancel(&self, task_id: i64, reason: &str) -> Result<Task> {
        let task = self.inner.db.read(|conn| tasks::get(conn, task_id))?;
        if !task.can_cancel() {
            return Err(ControlError::InvalidParam(format!(
                "task {task_id} cannot be cancelled in status {}",
                task.status
            )));
        }
        let ended = self.inner.db.write(|tx| {
            let current = tasks::get(tx, task_id)?;
            if current.status == TaskStatus::Pending {
                tasks::finish(tx, task_id, TaskStatus::Cancelled, reason, None)
            } else {
                tasks::set_cancelling(tx, task_id, reason)?;
                Ok(false)
            }
        })?;
        if ended {
            self.release_holds(&task);
        } else {
            self.signal(task_id);
        }
        tracing::info!(task_id, reason, "任务取消请求已处理");
        self.inner.db.read(|conn| tasks::get(conn, task_id))
    }

    /// Administrator force-stop. A task with no live worker is closed directly.
    pub fn force_cancel(&self, task_id: i64, reason: &str) -> Result<Task> {
        let task = self.inner.db.read(|conn| tasks::get(conn, task_id))?;
        if !task.can_force_stop() && task.status != TaskStatus::Pending {
            return Err(ControlError::InvalidParam(format!(
                "task {task_id} cannot be force-stopped in status {}",
                task.status
            )));
        }
        if self.signal(task_id) {
            self.inner
                .db
                .write(|tx| tasks::set_cancelling(tx, task_id, reason))?;
        } else {
            let ended = self.inner.db.write(|tx| {
                tasks::finish(tx, task_id, TaskStatus::Cancelled, reason, Some(reason))
            })?;
            if ended {
                self.release_holds(&task);
            }
        }
        tracing::warn!(task_id, reason, "任务已被强制停止");
        self.inner.db.read(|conn| tasks::get(conn, task_id))
    }

    /// Poll until the task reaches a terminal status or `timeout` elapses.
    pub async fn wait_terminal(&self, task_id: i64, timeout: Duration) -> Result<Task> {
        let ctx = OpContext::background().with_timeout(timeout);
        loop {
            let task = self.inner.db.read(|conn| tasks::get(conn, task_id))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            ctx.sleep(Duration::from_millis(50)).await?;
        }
    }

    /// Stop taking tasks, wait up to the configured grace for running ones, then cancel the
    /// rest.
    pub async fn shutdown(&self) {
        self.inner.accepting.cancel();
        let workers: Vec<_> = match self.pools() {
            Ok(mut pools) => pools
                .drain()
                .flat_map(|(_, pool)| pool.into_workers())
                .collect(),
            Err(err) => {
                tracing::error!(error = %err, "无法获取任务池");
                Vec::new()
            }
        };

        let grace = Duration::from_secs(self.inner.config.tasks.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        let mut leftover = Vec::new();
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                leftover.push(worker);
            }
        }
        if !leftover.is_empty() {
            tracing::warn!(remaining = leftover.len(), "等待任务结束超时，取消剩余任务");
            self.inner.root.cancel();
            for mut worker in leftover {
                if tokio::time::timeout(SHUTDOWN_FINAL_GRACE, &mut worker)
                    .await
                    .is_err()
                {
                    worker.abort();
                }
            }
        }
        self.inner.root.cancel();
        tracing::info!("任务系统已停止");
    }
}
