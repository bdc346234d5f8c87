use super::create::mapping_rule;
use super::{generate_password, Progress, TaskManager, PASSWORD_LEN};
use crate::context::OpContext;
use crate::ledger::{self, ResourceRequest};
use crate::models::{
    Host, HostType, Instance, InstanceActionData, InstanceStatus, PortMapping, Task,
};
use crate::ports::{self, probe_listening_ports};
use crate::providers::{InstanceConfig, Provider};
use crate::retry::{with_retries_async, Backoff};
use crate::state::instances::InstanceAddresses;
use crate::state::{hosts, instances};
use crate::{ControlError, Result};
use std::time::Duration;

const GONE_TICK: Duration = Duration::from_secs(10);
const GONE_TICKS: u32 = 10;
const PASSWORD_ATTEMPTS: u32 = 3;
const RESET_PASSWORD_BACKOFF: Duration = Duration::from_secs(3);

/// Wait until the hypervisor no longer knows `name`. Gives up quietly after the last tick.
async fn wait_gone(provider: &dyn Provider, ctx: &OpContext, name: &str) -> Result<()> {
    for _ in 0..GONE_TICKS {
        match provider.get_instance(ctx, name).await {
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) if err.is_missing_instance() => return Ok(()),
            _ => {}
        }
        ctx.sleep(GONE_TICK).await?;
    }
    tracing::warn!(instance = name, "等待实例删除超时，继续重建");
    Ok(())
}

fn load(manager: &TaskManager, instance_id: i64) -> Result<(Instance, Host)> {
    manager.db().read(|conn| {
        let instance = instances::get(conn, instance_id)?;
        let host = hosts::get(conn, instance.host_id)?;
        Ok((instance, host))
    })
}

/// Rebuild an instance from its image, keeping its name, size and port mappings.
pub(super) async fn run_reset(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: InstanceActionData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(5, "准备重置实例");

    let (instance, host) = load(manager, data.instance_id)?;
    if !matches!(instance.status, InstanceStatus::Running | InstanceStatus::Stopped) {
        return Err(ControlError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: "reset".to_string(),
        });
    }
    let saved = manager.ports().list(instance.id)?;
    let provider = manager.registry().get(host.id)?;

    progress.report(10, "正在删除旧实例");
    provider.delete_instance(ctx, &instance.name).await?;
    progress.report(20, "等待旧实例删除完成");

    match rebuild(manager, ctx, &instance, &host, provider.as_ref(), &saved, &progress).await {
        Ok(message) => Ok(message),
        Err(err) => {
            // The old instance is gone, so whatever it held goes back.
            let released = manager.db().write(|tx| {
                instances::set_status(tx, instance.id, InstanceStatus::Failed)?;
                ledger::release_in(tx, &ResourceRequest::from(&instance))?;
                ports::release_instance_ports(tx, instance.id)
            });
            if let Err(release_err) = released {
                tracing::error!(instance = %instance.name, error = %release_err, "重置失败后释放资源出错");
            }
            Err(err)
        }
    }
}

async fn rebuild(
    manager: &TaskManager,
    ctx: &OpContext,
    instance: &Instance,
    host: &Host,
    provider: &dyn Provider,
    saved: &[PortMapping],
    progress: &Progress,
) -> Result<String> {
    wait_gone(provider, ctx, &instance.name).await?;

    progress.report(30, "正在重新创建实例");
    let password = generate_password(PASSWORD_LEN);
    let config = InstanceConfig {
        name: instance.name.clone(),
        instance_type: instance.instance_type,
        image: instance.image_name.clone(),
        image_url: Some(instance.image_url.clone()).filter(|u| !u.is_empty()),
        cpu: instance.cpu_cores,
        memory_mb: instance.memory_mb,
        disk_mb: instance.disk_mb,
        bandwidth_mbps: instance.bandwidth_mbps,
        password: password.clone(),
        network_type: host.network_type,
        ports: if host.host_type == HostType::Docker {
            saved.iter().map(mapping_rule).collect()
        } else {
            Vec::new()
        },
    };
    provider
        .create_instance(ctx, &config, progress.window(30, 60))
        .await?;

    progress.report(65, "刷新实例网络信息");
    let private_ip = match provider.get_instance_ipv4(ctx, &instance.name).await {
        Ok(ip) => ip,
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            tracing::warn!(instance = %instance.name, error = %err, "获取实例IPv4地址失败");
            None
        }
    };
    let addresses = InstanceAddresses {
        private_ip: private_ip.clone(),
        ..Default::default()
    };
    manager.db().write(|tx| {
        instances::set_addresses(tx, instance.id, &addresses)?;
        instances::set_status(tx, instance.id, InstanceStatus::Running)
    })?;

    progress.report(70, "设置实例密码");
    let name = instance.name.as_str();
    let secret = password.as_str();
    match with_retries_async(
        ctx,
        PASSWORD_ATTEMPTS,
        Backoff::Linear(RESET_PASSWORD_BACKOFF),
        |_| true,
        |_| provider.set_instance_password(ctx, name, secret),
    )
    .await
    {
        Ok(()) => {}
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => tracing::warn!(instance = %name, error = %err, "重置后设置密码失败"),
    }
    manager
        .db()
        .write(|tx| instances::set_password(tx, instance.id, &password))?;

    progress.report(80, "恢复端口映射");
    let mappings = if saved.is_empty() && !host.network_type.skips_default_mappings() {
        let shell = manager.registry().shell(host.id)?;
        let occupied = probe_listening_ports(shell.as_ref(), ctx).await;
        manager
            .ports()
            .allocate_default(instance.id, host.id, &occupied)?
    } else {
        saved.to_vec()
    };
    if host.host_type != HostType::Docker {
        for mapping in &mappings {
            match provider
                .add_port_forward(
                    ctx,
                    name,
                    private_ip.as_deref(),
                    &mapping_rule(mapping),
                    mapping.mapping_method,
                )
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_interrupt() => return Err(err),
                Err(err) => {
                    tracing::warn!(instance = %name, host_port = mapping.host_port, error = %err, "恢复端口映射失败");
                    manager.ports().mark_failed(mapping.id)?;
                }
            }
        }
    }
    let ssh_port = mappings
        .iter()
        .find(|m| m.is_ssh)
        .map(|m| m.host_port)
        .unwrap_or(22);
    manager
        .db()
        .write(|tx| instances::set_ssh_port(tx, instance.id, ssh_port))?;

    progress.report(100, "实例重置成功");
    tracing::info!(instance = %name, ports = mappings.len(), ssh_port, "实例重置完成");
    Ok("实例重置成功".to_string())
}

/// Set a fresh password on a running instance and persist it.
pub(super) async fn run_reset_password(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
) -> Result<String> {
    let data: InstanceActionData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(10, "准备重置密码");

    let (instance, host) = load(manager, data.instance_id)?;
    if instance.status != InstanceStatus::Running {
        return Err(ControlError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: "reset-password".to_string(),
        });
    }
    let handle = manager.registry().get(host.id)?;
    let provider = handle.as_ref();
    let password = generate_password(PASSWORD_LEN);

    progress.report(40, "正在设置新密码");
    let sleep = Duration::from_secs(manager.config().tasks.reset_password_retry_sleep_secs);
    let name = instance.name.as_str();
    let secret = password.as_str();
    with_retries_async(
        ctx,
        PASSWORD_ATTEMPTS,
        Backoff::Fixed(sleep),
        |_| true,
        |_| provider.set_instance_password(ctx, name, secret),
    )
    .await?;

    progress.report(80, "保存新密码");
    manager
        .db()
        .write(|tx| instances::set_password(tx, instance.id, &password))?;
    progress.report(100, "密码重置成功");
    tracing::info!(instance = %name, "实例密码已重置");
    Ok("密码重置成功".to_string())
}
