use super::{generate_password, Progress, TaskManager, PASSWORD_LEN};
use crate::context::OpContext;
use crate::ledger::{self, ResourceRequest};
use crate::models::{
    now_ts, CreateTaskData, Host, HostType, Image, Instance, InstanceStatus, PortMapping, Task,
    TaskStatus,
};
use crate::ports::{self, probe_listening_ports};
use crate::providers::{self, InstanceConfig, PortRule, Provider};
use crate::retry::{with_retries_async, Backoff};
use crate::state::instances::InstanceAddresses;
use crate::state::{hosts, images, instances, tasks};
use crate::{traffic, ControlError, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const NAME_ATTEMPTS: usize = 10;
const PASSWORD_ATTEMPTS: u32 = 3;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Rows written by the admission phase.
struct Prepared {
    host: Host,
    image: Image,
    instance: Instance,
    mappings: Vec<PortMapping>,
}

pub(super) fn mapping_rule(m: &PortMapping) -> PortRule {
    PortRule {
        host_port: m.host_port,
        guest_port: m.guest_port,
        protocol: m.protocol,
    }
}

fn unique_name(conn: &Connection, host: &Host, suffix: fn() -> String) -> Result<String> {
    for _ in 0..NAME_ATTEMPTS {
        let name = format!("{}-{}", host.name, suffix());
        if !instances::name_exists(conn, host.id, &name)? {
            return Ok(name);
        }
    }
    Err(ControlError::Internal(format!(
        "could not pick a free instance name on host {}",
        host.name
    )))
}

fn request_for(
    manager: &TaskManager,
    task: &Task,
    data: &CreateTaskData,
    image: &Image,
) -> Result<ResourceRequest> {
    let specs = &manager.config().specs;
    Ok(ResourceRequest {
        user_id: task.user_id,
        host_id: data.provider_id,
        instance_type: image.instance_type,
        cpu: specs.cpu(&data.cpu_id)?,
        memory_mb: specs.memory(&data.memory_id)?,
        disk_mb: specs.disk(&data.disk_id)?,
        bandwidth_mbps: specs.bandwidth(&data.bandwidth_id)?,
    })
}

/// Phase one, in a single transaction: take over the reservation, pick a name, write the
/// instance row in `creating` and allocate its default ports.
fn prepare(
    conn: &Connection,
    manager: &TaskManager,
    task: &Task,
    data: &CreateTaskData,
    occupied: &HashSet<u16>,
) -> Result<Prepared> {
    let host = hosts::get(conn, data.provider_id)?;
    if let Some(reason) = host.unavailable_reason(now_ts()) {
        return Err(ControlError::HostUnavailable(reason));
    }
    let image = images::get(conn, data.image_id)?;
    image.check_host(&host)?;
    let req = request_for(manager, task, data, &image)?;
    ledger::claim_in(conn, manager.config(), &data.session_id, &req)?;

    let now = now_ts();
    let instance = Instance {
        id: 0,
        name: unique_name(conn, &host, manager.inner.suffix)?,
        host_id: host.id,
        user_id: task.user_id,
        image_name: image.name.clone(),
        image_url: image.url.clone(),
        instance_type: image.instance_type,
        cpu_cores: req.cpu,
        memory_mb: req.memory_mb,
        disk_mb: req.disk_mb,
        bandwidth_mbps: req.bandwidth_mbps,
        status: InstanceStatus::Creating,
        os_type: image.os_type.clone(),
        username: "root".to_string(),
        password: generate_password(PASSWORD_LEN),
        public_ip: Some(host.address()),
        private_ip: None,
        ipv6_address: None,
        public_ipv6: None,
        ssh_port: 22,
        vnstat_interface: None,
        traffic_limited: false,
        expires_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    let instance_id = instances::insert(conn, &instance)?;
    tasks::set_instance(conn, task.id, instance_id)?;
    tasks::set_status(conn, task.id, TaskStatus::Processing)?;
    let mappings = ports::allocate_default_in(conn, instance_id, host.id, occupied)?;

    Ok(Prepared {
        instance: instances::get(conn, instance_id)?,
        host,
        image,
        mappings,
    })
}

pub(super) async fn run(manager: &TaskManager, task: &Task, ctx: &OpContext) -> Result<String> {
    let data: CreateTaskData = task.payload()?;
    let progress = manager.progress(task.id);
    progress.report(10, "准备创建实例");

    let prepared = match admit(manager, task, &data, ctx).await {
        Ok(prepared) => prepared,
        Err(err) => {
            if let Err(release_err) = manager.ledger().cancel_reservation(&data.session_id) {
                tracing::error!(task_id = task.id, error = %release_err, "释放资源预留失败");
            }
            return Err(err);
        }
    };
    let instance_id = prepared.instance.id;
    tracing::info!(
        task_id = task.id,
        instance = %prepared.instance.name,
        host = %prepared.host.name,
        "实例记录已创建"
    );
    progress.report(25, "实例记录已创建");

    let provider = match build_instance(manager, task, ctx, &prepared, &progress).await {
        Ok(provider) => provider,
        Err(err) => {
            tracing::error!(task_id = task.id, instance_id, error = %err, "实例创建失败");
            if let Err(cleanup_err) = manager.fail_creation(task.host_id, instance_id) {
                tracing::error!(instance_id, error = %cleanup_err, "清理失败实例资源出错");
            }
            return Err(err);
        }
    };

    let private_ip = match finalize(manager, ctx, &prepared, provider.as_ref()).await {
        Ok(private_ip) => private_ip,
        Err(err) => {
            tracing::error!(task_id = task.id, instance_id, error = %err, "实例就绪确认失败");
            if let Err(cleanup_err) = manager.fail_creation(task.host_id, instance_id) {
                tracing::error!(instance_id, error = %cleanup_err, "清理失败实例资源出错");
            }
            return Err(err);
        }
    };
    progress.report(70, "实例已运行，开始后续配置");

    let monitoring_ok = post_create(
        manager,
        ctx,
        &prepared,
        provider.as_ref(),
        private_ip.as_deref(),
        &progress,
    )
    .await?;

    if monitoring_ok {
        Ok("实例创建成功".to_string())
    } else {
        Ok("实例创建成功，但部分监控服务初始化失败".to_string())
    }
}

async fn admit(
    manager: &TaskManager,
    task: &Task,
    data: &CreateTaskData,
    ctx: &OpContext,
) -> Result<Prepared> {
    let host = manager.db().read(|conn| hosts::get(conn, data.provider_id))?;
    let occupied = if host.network_type.skips_default_mappings() {
        HashSet::new()
    } else {
        let shell = manager.registry().shell(host.id)?;
        probe_listening_ports(shell.as_ref(), ctx).await
    };
    ctx.check()?;
    manager
        .db()
        .write(|tx| prepare(tx, manager, task, data, &occupied))
}

/// Phase two: drive the hypervisor.
async fn build_instance(
    manager: &TaskManager,
    task: &Task,
    ctx: &OpContext,
    prepared: &Prepared,
    progress: &Progress,
) -> Result<Arc<dyn Provider>> {
    manager
        .db()
        .write(|tx| tasks::set_status(tx, task.id, TaskStatus::Running))?;
    progress.report(30, "正在创建实例");

    let provider = manager.registry().get(prepared.host.id)?;
    let instance = &prepared.instance;
    let config = InstanceConfig {
        name: instance.name.clone(),
        instance_type: instance.instance_type,
        image: prepared.image.name.clone(),
        image_url: Some(prepared.image.url.clone()).filter(|u| !u.is_empty()),
        cpu: instance.cpu_cores,
        memory_mb: instance.memory_mb,
        disk_mb: instance.disk_mb,
        bandwidth_mbps: instance.bandwidth_mbps,
        password: instance.password.clone(),
        network_type: prepared.host.network_type,
        ports: if prepared.host.host_type == HostType::Docker {
            prepared.mappings.iter().map(mapping_rule).collect()
        } else {
            Vec::new()
        },
    };
    progress.report(40, "正在创建实例");
    provider
        .create_instance(ctx, &config, progress.window(40, 60))
        .await?;
    progress.report(60, "实例创建完成");
    Ok(provider)
}

/// Phase three on success: learn the addresses and mark the instance running.
async fn finalize(
    manager: &TaskManager,
    ctx: &OpContext,
    prepared: &Prepared,
    provider: &dyn Provider,
) -> Result<Option<String>> {
    let name = &prepared.instance.name;
    let private_ip = match provider.get_instance_ipv4(ctx, name).await {
        Ok(ip) => ip,
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            tracing::warn!(instance = %name, error = %err, "获取实例IPv4地址失败");
            None
        }
    };
    let ipv6 = if prepared.host.network_type.has_ipv6() {
        match provider.get_instance_ipv6(ctx, name).await {
            Ok(addrs) => addrs,
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => {
                tracing::warn!(instance = %name, error = %err, "获取实例IPv6地址失败");
                Default::default()
            }
        }
    } else {
        Default::default()
    };

    let addresses = InstanceAddresses {
        public_ip: Some(prepared.host.address()),
        private_ip: private_ip.clone(),
        ipv6_address: ipv6.internal,
        public_ipv6: ipv6.public,
    };
    let instance_id = prepared.instance.id;
    manager.db().write(|tx| {
        instances::set_addresses(tx, instance_id, &addresses)?;
        instances::set_status(tx, instance_id, InstanceStatus::Running)
    })?;
    tracing::info!(instance = %name, private_ip = ?private_ip, "实例已就绪");
    Ok(private_ip)
}

/// Post-processing after the instance runs. Every step is best effort; interrupts stop the
/// remaining steps. Returns false when traffic monitoring could not be set up.
async fn post_create(
    manager: &TaskManager,
    ctx: &OpContext,
    prepared: &Prepared,
    provider: &dyn Provider,
    private_ip: Option<&str>,
    progress: &Progress,
) -> Result<bool> {
    let instance = &prepared.instance;
    let name = instance.name.as_str();
    let boot_wait = Duration::from_secs(manager.config().tasks.post_create_boot_wait_secs);
    if !boot_wait.is_zero() {
        progress.report(72, "等待实例启动完成");
        ctx.sleep(boot_wait).await?;
    }

    if prepared.host.host_type != HostType::Docker {
        progress.report(75, "配置端口映射");
        for mapping in &prepared.mappings {
            let rule = mapping_rule(mapping);
            match provider
                .add_port_forward(ctx, name, private_ip, &rule, mapping.mapping_method)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_interrupt() => return Err(err),
                Err(err) => {
                    tracing::warn!(instance = %name, host_port = mapping.host_port, error = %err, "端口映射创建失败");
                    if let Err(mark_err) = manager.ports().mark_failed(mapping.id) {
                        tracing::warn!(port_id = mapping.id, error = %mark_err, "更新端口状态失败");
                    }
                }
            }
        }
    }

    progress.report(85, "初始化流量监控");
    let mut monitoring_ok = true;
    match providers::init_vnstat(provider, ctx, name).await {
        Ok(interface) => {
            manager
                .db()
                .write(|tx| instances::set_vnstat_interface(tx, instance.id, &interface))?;
        }
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            tracing::warn!(instance = %name, error = %err, "vnStat监控初始化失败");
            monitoring_ok = false;
        }
    }

    progress.report(90, "设置实例密码");
    let password = instance.password.as_str();
    let retry_base = Duration::from_secs(manager.config().tasks.password_retry_sleep_secs);
    match with_retries_async(
        ctx,
        PASSWORD_ATTEMPTS,
        Backoff::Exponential(retry_base),
        |_| true,
        |_| provider.set_instance_password(ctx, name, password),
    )
    .await
    {
        Ok(()) => {}
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => tracing::warn!(instance = %name, error = %err, "设置实例密码失败"),
    }

    progress.report(95, "同步流量数据");
    if let Err(err) = traffic::sync_instance(manager.db(), instance.id) {
        tracing::warn!(instance = %name, error = %err, "首次流量同步失败");
    }
    Ok(monitoring_ok)
}

impl TaskManager {
    /// Mark an instance that is still `creating` as failed, give its resources and ports back
    /// and schedule removal of whatever the hypervisor built. Returns false when the instance
    /// had already left `creating`.
    pub(crate) fn fail_creation(&self, host_id: Option<i64>, instance_id: i64) -> Result<bool> {
        let failed = self.db().write(|tx| {
            let instance = instances::get(tx, instance_id)?;
            if instance.status != InstanceStatus::Creating {
                return Ok(None);
            }
            instances::set_status(tx, instance_id, InstanceStatus::Failed)?;
            ledger::release_in(tx, &ResourceRequest::from(&instance))?;
            ports::release_instance_ports(tx, instance_id)?;
            Ok(Some(instance))
        })?;
        let Some(instance) = failed else {
            return Ok(false);
        };
        tracing::info!(instance = %instance.name, "实例创建失败，已释放资源");
        self.schedule_cleanup(host_id.unwrap_or(instance.host_id), instance.name);
        Ok(true)
    }

    /// Delete a half-built instance from its hypervisor after a short delay.
    fn schedule_cleanup(&self, host_id: i64, name: String) {
        let manager = self.clone();
        let delay = Duration::from_secs(self.config().tasks.failed_instance_cleanup_delay_secs);
        tokio::spawn(async move {
            let ctx = manager.detached_context(delay + CLEANUP_TIMEOUT);
            if ctx.sleep(delay).await.is_err() {
                return;
            }
            let provider = match manager.registry().get(host_id) {
                Ok(provider) => provider,
                Err(err) => {
                    tracing::warn!(instance = %name, error = %err, "清理失败实例时无法获取节点");
                    return;
                }
            };
            match provider.delete_instance(&ctx, &name).await {
                Ok(()) => tracing::info!(instance = %name, "已清理创建失败的实例"),
                Err(err) => tracing::warn!(instance = %name, error = %err, "清理失败实例出错"),
            }
        });
    }
}
