use super::TaskManager;
use crate::context::OpContext;
use crate::ledger::{self, ResourceRequest};
use crate::models::{InstanceActionData, InstanceStatus, Task, TaskType};
use crate::ports;
use crate::providers::{Provider, RuntimeStatus};
use crate::state::instances;
use crate::{ControlError, Result};
use std::time::Duration;

const START_RECHECK: Duration = Duration::from_secs(3);

fn verb(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Start => "启动",
        TaskType::Stop => "停止",
        TaskType::Restart => "重启",
        _ => "操作",
    }
}

async fn is_running(provider: &dyn Provider, ctx: &OpContext, name: &str) -> bool {
    matches!(
        provider.get_instance(ctx, name).await,
        Ok(info) if info.status == RuntimeStatus::Running
    )
}

/// Start, stop or restart an instance.
pub(super) async fn run_power(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: InstanceActionData = task.payload()?;
    let action = task.task_type;
    let verb = verb(action);
    let progress = manager.progress(task.id);
    progress.report(10, &format!("准备{verb}实例"));

    let instance = manager
        .db()
        .read(|conn| instances::get(conn, data.instance_id))?;
    let (allowed, target) = match action {
        TaskType::Start => (instance.status.can_start(), InstanceStatus::Running),
        TaskType::Stop => (
            instance.status.can_stop() || instance.status == InstanceStatus::Stopped,
            InstanceStatus::Stopped,
        ),
        TaskType::Restart => (instance.status.can_start(), InstanceStatus::Running),
        other => {
            return Err(ControlError::Internal(format!(
                "{other} is not a power action"
            )))
        }
    };
    if !allowed {
        return Err(ControlError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: target.to_string(),
        });
    }

    let provider = manager.registry().get(instance.host_id)?;
    progress.report(30, "已连接节点");
    progress.report(50, &format!("正在{verb}实例"));

    let mut skipped = false;
    match action {
        TaskType::Start => {
            if is_running(provider.as_ref(), ctx, &instance.name).await {
                ctx.sleep(START_RECHECK).await?;
                skipped = is_running(provider.as_ref(), ctx, &instance.name).await;
            }
            if skipped {
                tracing::info!(instance = %instance.name, "实例已在运行，跳过启动");
            } else {
                provider.start_instance(ctx, &instance.name).await?;
            }
        }
        TaskType::Stop => provider.stop_instance(ctx, &instance.name).await?,
        _ => provider.restart_instance(ctx, &instance.name).await?,
    }
    progress.report(80, "更新实例状态");

    manager.db().write(|tx| {
        instances::set_status(tx, instance.id, target)?;
        if data.traffic_control {
            instances::set_traffic_limited(tx, instance.id, action == TaskType::Stop)?;
        }
        Ok(())
    })?;
    tracing::info!(
        instance = %instance.name,
        action = %action,
        traffic_control = data.traffic_control,
        "实例操作完成"
    );
    progress.report(100, &format!("实例{verb}成功"));
    if skipped {
        Ok("实例已在运行".to_string())
    } else {
        Ok(format!("实例{verb}成功"))
    }
}

/// Delete an instance. Only the hypervisor call can fail the task; the bookkeeping after it
/// always runs.
pub(super) async fn run_delete(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: InstanceActionData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(10, "准备删除实例");

    let instance = manager
        .db()
        .read(|conn| instances::get(conn, data.instance_id))?;
    if instance.status == InstanceStatus::Deleted {
        return Ok("实例已删除".to_string());
    }
    let held = instance.status.holds_resources();
    manager
        .db()
        .write(|tx| instances::set_status(tx, instance.id, InstanceStatus::Deleting))?;
    progress.report(30, "正在删除实例");

    let removed = match manager.registry().get(instance.host_id) {
        Ok(provider) => provider.delete_instance(ctx, &instance.name).await,
        Err(err) => Err(err),
    };
    if let Err(err) = removed {
        manager
            .db()
            .write(|tx| instances::set_status(tx, instance.id, instance.status))?;
        return Err(err);
    }
    progress.report(70, "释放实例资源");

    manager.db().write(|tx| {
        ports::release_instance_ports(tx, instance.id)?;
        if held {
            ledger::release_in(tx, &ResourceRequest::from(&instance))?;
        }
        instances::soft_delete(tx, instance.id)
    })?;
    tracing::info!(instance = %instance.name, released = held, "实例删除完成");
    progress.report(100, "实例删除成功");
    Ok("实例删除成功".to_string())
}
