use super::TaskManager;
use crate::models::{now_ts, CreateTaskData, Task, TaskStatus, TaskType};
use crate::state::tasks;
use crate::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(super) const RESTART_MESSAGE: &str = "服务重启，任务被中断";
const CANCELLING_TIMEOUT_MESSAGE: &str = "Force cancelled - cancelling timeout";

/// What startup recovery did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub requeued: usize,
    pub reservations_swept: usize,
}

impl TaskManager {
    /// Give back whatever a task that will never finish normally was holding: a create task's
    /// reservation, or the resources and ports of the instance it was building.
    pub(crate) fn release_holds(&self, task: &Task) {
        if task.task_type != TaskType::Create {
            return;
        }
        let result = match task.instance_id {
            Some(instance_id) => self.fail_creation(task.host_id, instance_id).map(|_| ()),
            None => task
                .payload::<CreateTaskData>()
                .and_then(|data| self.ledger().cancel_reservation(&data.session_id)),
        };
        if let Err(err) = result {
            tracing::error!(task_id = task.id, error = %err, "释放任务占用资源失败");
        }
    }

    /// Startup recovery. Tasks caught mid-flight by a restart fail, their holds are released,
    /// and pending tasks are queued again in creation order.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let stranded = self.db().read(|conn| {
            tasks::list_by_status(
                conn,
                &[TaskStatus::Running, TaskStatus::Processing, TaskStatus::Cancelling],
            )
        })?;
        for task in &stranded {
            let status = if task.status == TaskStatus::Cancelling {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            let ended = self.db().write(|tx| {
                tasks::finish(tx, task.id, status, RESTART_MESSAGE, Some(RESTART_MESSAGE))
            })?;
            if ended {
                self.release_holds(task);
                report.interrupted += 1;
            }
        }

        report.reservations_swept = self.ledger().sweep_expired()?;

        let pending = self
            .db()
            .read(|conn| tasks::list_by_status(conn, &[TaskStatus::Pending]))?;
        for task in &pending {
            match self.enqueue(task) {
                Ok(()) => report.requeued += 1,
                Err(err) => tracing::error!(task_id = task.id, error = %err, "重新入队任务失败"),
            }
        }
        tracing::info!(
            interrupted = report.interrupted,
            requeued = report.requeued,
            swept = report.reservations_swept,
            "任务恢复完成"
        );
        Ok(report)
    }

    /// One reaper pass: overdue tasks time out and tasks stuck in `cancelling` are closed.
    /// Returns how many tasks were ended.
    pub fn reap_once(&self) -> Result<usize> {
        let now = now_ts();
        let mut ended = 0;

        for task in self.db().read(|conn| tasks::list_overdue(conn, now))? {
            let message = format!(
                "Task timeout - exceeded {} minutes",
                task.timeout_duration_s / 60
            );
            let closed = self.db().write(|tx| {
                tasks::finish(tx, task.id, TaskStatus::Timeout, &message, Some(&message))
            })?;
            if closed {
                self.signal(task.id);
                self.release_holds(&task);
                tracing::warn!(task_id = task.id, task_type = %task.task_type, "任务执行超时");
                ended += 1;
            }
        }

        let cutoff = now - self.config().tasks.cancelling_timeout_secs as i64;
        for task in self.db().read(|conn| tasks::list_stale_cancelling(conn, cutoff))? {
            let closed = self.db().write(|tx| {
                tasks::finish(
                    tx,
                    task.id,
                    TaskStatus::Cancelled,
                    CANCELLING_TIMEOUT_MESSAGE,
                    Some(CANCELLING_TIMEOUT_MESSAGE),
                )
            })?;
            if closed {
                self.signal(task.id);
                self.release_holds(&task);
                tracing::warn!(task_id = task.id, "取消超时，任务已强制结束");
                ended += 1;
            }
        }
        Ok(ended)
    }
}

/// Run `reap_once` every `reaper_interval_secs` until `token` fires.
pub fn spawn_reaper(manager: TaskManager, token: CancellationToken) -> JoinHandle<()> {
    let interval = Duration::from_secs(manager.config().tasks.reaper_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = manager.reap_once() {
                tracing::error!(error = %err, "任务超时检查失败");
            }
        }
        tracing::debug!("任务超时检查已停止");
    })
}
