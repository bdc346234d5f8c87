use super::create::mapping_rule;
use super::TaskManager;
use crate::context::OpContext;
use crate::models::{CreatePortMappingData, DeletePortMappingData, PortStatus, Task};
use crate::providers::PortRule;
use crate::state::{hosts, instances, ports};
use crate::Result;

/// Install the forwarding rule for a mapping row written at submission.
pub(super) async fn run_create(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: CreatePortMappingData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(10, "准备创建端口映射");

    let (mapping, instance) = manager.db().read(|conn| {
        Ok((
            ports::get(conn, data.port_id)?,
            instances::get(conn, data.instance_id)?,
        ))
    })?;

    progress.report(50, "正在配置端口转发");
    let installed = match manager.registry().get(instance.host_id) {
        Ok(provider) => {
            provider
                .add_port_forward(
                    ctx,
                    &instance.name,
                    instance.private_ip.as_deref(),
                    &mapping_rule(&mapping),
                    mapping.mapping_method,
                )
                .await
        }
        Err(err) => Err(err),
    };
    if let Err(err) = installed {
        manager.ports().mark_failed(mapping.id)?;
        return Err(err);
    }
    manager
        .db()
        .write(|tx| ports::set_status(tx, mapping.id, PortStatus::Active))?;

    tracing::info!(
        instance = %instance.name,
        host_port = mapping.host_port,
        guest_port = mapping.guest_port,
        "端口映射创建成功"
    );
    progress.report(100, "端口映射创建成功");
    Ok("端口映射创建成功".to_string())
}

/// Remove a forwarding rule and its row. The rule removal is best effort and a row that is
/// already gone counts as success.
pub(super) async fn run_delete(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: DeletePortMappingData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(10, "准备删除端口映射");

    let (instance, row) = manager.db().read(|conn| {
        Ok((
            instances::get_unscoped(conn, data.instance_id)?,
            ports::find(conn, data.port_id)?,
        ))
    })?;
    let method = match &row {
        Some(mapping) => mapping.mapping_method,
        None => {
            manager
                .db()
                .read(|conn| hosts::get(conn, instance.host_id))?
                .ipv4_port_mapping_method
        }
    };
    let rule = PortRule {
        host_port: data.host_port,
        guest_port: data.guest_port,
        protocol: data.protocol,
    };

    progress.report(50, "正在移除端口转发");
    let removed = match manager.registry().get(instance.host_id) {
        Ok(provider) => {
            provider
                .remove_port_forward(
                    ctx,
                    &instance.name,
                    instance.private_ip.as_deref(),
                    &rule,
                    method,
                )
                .await
        }
        Err(err) => Err(err),
    };
    match removed {
        Ok(()) => {}
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            tracing::warn!(instance = %instance.name, host_port = data.host_port, error = %err, "移除端口转发规则失败")
        }
    }

    progress.report(80, "删除端口映射记录");
    if manager.ports().remove(data.port_id)?.is_none() {
        tracing::info!(port_id = data.port_id, "端口映射记录已不存在");
    }
    progress.report(100, "端口映射删除成功");
    Ok("端口映射删除成功".to_string())
}
