//! Docker adapter. The daemon is driven through its CLI over SSH; there is no API path.

use super::{
    sealed, HealthReport, ImageInfo, InstanceConfig, InstanceInfo, Ipv6Addresses, PortRule,
    ProgressFn, Provider, ProviderDeps, RuntimeStatus, Selector,
};
use crate::context::OpContext;
use crate::images::ImageRequest;
use crate::models::{Host, HostType, MappingMethod};
use crate::providers::lxd::cli::chpasswd_script;
use crate::retry::{with_retries_async, Backoff};
use crate::ssh::shell_quote;
use crate::{ControlError, Result};
use async_trait::async_trait;
use std::time::Duration;

const INSPECT_FORMAT: &str = "{{.Name}}|{{.State.Status}}|{{.Config.Image}}|{{.Id}}|{{.Created}}";
const PS_FORMAT: &str = "{{.Names}}|{{.State}}|{{.Image}}|{{.ID}}";
const IPV6_NETWORK: &str = "ipv6_net";
const DELETE_ATTEMPTS: u32 = 3;

/// `docker inspect` output for one container.
pub fn parse_inspect(output: &str) -> Result<InstanceInfo> {
    let line = output.trim();
    if line.is_empty() {
        return Err(ControlError::InstanceNotFound("empty inspect output".into()));
    }
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 4 {
        return Err(ControlError::hypervisor("unexpected docker inspect output", line));
    }
    Ok(InstanceInfo {
        id: fields[3].to_string(),
        name: fields[0].trim_start_matches('/').to_string(),
        status: RuntimeStatus::from_raw(fields[1]),
        instance_type: Some(crate::models::InstanceType::Container),
        image: Some(fields[2].to_string()),
        ipv4: None,
        ipv6: None,
    })
}

/// `docker ps -a` rows in [`PS_FORMAT`].
pub fn parse_ps(output: &str) -> Vec<InstanceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 4 || fields[0].is_empty() {
                return None;
            }
            Some(InstanceInfo {
                id: fields[3].to_string(),
                name: fields[0].to_string(),
                status: RuntimeStatus::from_raw(fields[1]),
                instance_type: Some(crate::models::InstanceType::Container),
                image: Some(fields[2].to_string()),
                ipv4: None,
                ipv6: None,
            })
        })
        .collect()
}

/// `docker images` rows: repository, tag, id, size.
pub fn parse_images(output: &str) -> Vec<ImageInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(ImageInfo {
                id: fields[2].to_string(),
                name: format!("{}:{}", fields[0], fields[1]),
                size: Some(fields[3].to_string()),
                description: None,
            })
        })
        .collect()
}

/// Image name printed by `docker load`.
pub fn loaded_image(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.split_once("Loaded image:"))
        .map(|(_, name)| name.trim())
        .filter(|name| !name.is_empty())
}

/// Errors after which the SSH session should be re-established and the command retried.
pub fn is_connection_error(err: &ControlError) -> bool {
    if matches!(err, ControlError::Ssh(_)) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    [
        "connection refused",
        "connection lost",
        "connection reset",
        "network is unreachable",
        "no route to host",
        "connection timed out",
        "broken pipe",
        "eof",
        "handshake failed",
        "unable to authenticate",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

/// `docker run` for a new container. Host ports are bound at creation.
pub fn run_command(config: &InstanceConfig, ipv6_network: bool) -> String {
    let mut cmd = format!(
        "docker run -d --name {} --hostname {} --cpus {} --memory {}m --restart unless-stopped",
        shell_quote(&config.name),
        shell_quote(&config.name),
        config.cpu.max(1),
        config.memory_mb.max(6)
    );
    if ipv6_network {
        cmd.push_str(&format!(" --network {IPV6_NETWORK}"));
    }
    for rule in &config.ports {
        for transport in rule.protocol.transports() {
            cmd.push_str(&format!(
                " -p 0.0.0.0:{}:{}/{transport}",
                rule.host_port, rule.guest_port
            ));
        }
    }
    cmd.push_str(&format!(" {} sleep infinity", shell_quote(&config.image)));
    cmd
}

pub struct DockerProvider {
    host: Host,
    selector: Selector,
    deps: ProviderDeps,
}

impl DockerProvider {
    pub fn new(host: Host, deps: ProviderDeps) -> Self {
        Self {
            selector: Selector::new(host.name.clone(), host.execution_rule, false),
            host,
            deps,
        }
    }

    async fn ssh(&self, ctx: &OpContext, cmd: &str) -> Result<String> {
        self.deps.shell.execute(ctx, cmd).await
    }

    /// Every operation needs the SSH path.
    fn require_ssh(&self, op: &str) -> Result<()> {
        self.selector.require_path(op)
    }

    async fn image_exists(&self, ctx: &OpContext, image: &str) -> Result<bool> {
        let cmd = format!(
            "docker image inspect {} >/dev/null 2>&1 && echo exists || true",
            shell_quote(image)
        );
        match self.ssh(ctx, &cmd).await {
            Ok(out) => Ok(out.contains("exists")),
            Err(err) if err.is_interrupt() => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Make `config.image` available to the daemon: load a downloaded archive when the catalog
    /// gives a URL, pull from the registry otherwise.
    async fn prepare_image(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<()> {
        if self.image_exists(ctx, &config.image).await? {
            tracing::info!(host = %self.host.name, image = %config.image, "Docker镜像已存在，跳过");
            return Ok(());
        }
        let Some(url) = config.image_url.as_deref().filter(|u| !u.is_empty()) else {
            self.ssh(ctx, &format!("docker pull {}", shell_quote(&config.image)))
                .await?;
            return Ok(());
        };
        let path = self
            .deps
            .images
            .ensure_on_host(
                ctx,
                self.deps.shell.as_ref(),
                &self.host.name,
                &ImageRequest {
                    name: &config.image,
                    url,
                    architecture: &self.host.architecture,
                    host_type: HostType::Docker,
                    instance_type: config.instance_type,
                },
            )
            .await?;
        let out = self
            .ssh(ctx, &format!("docker load -i {}", shell_quote(&path)))
            .await?;
        if let Some(loaded) = loaded_image(&out) {
            if loaded != config.image {
                self.ssh(
                    ctx,
                    &format!("docker tag {} {}", shell_quote(loaded), shell_quote(&config.image)),
                )
                .await?;
            }
        }
        tracing::info!(host = %self.host.name, image = %config.image, "Docker镜像加载成功");
        Ok(())
    }

    /// Whether the host carries the `ipv6_net` network with a running ndpresponder.
    async fn ipv6_network_available(&self, ctx: &OpContext) -> Result<bool> {
        let out = self
            .ssh(
                ctx,
                &format!(
                    "docker network inspect {IPV6_NETWORK} >/dev/null 2>&1 && \
                     docker inspect -f '{{{{.State.Status}}}}' ndpresponder 2>/dev/null && \
                     [ -s /usr/local/bin/docker_check_ipv6 ] && echo valid || true"
                ),
            )
            .await?;
        Ok(out.contains("running") && out.contains("valid"))
    }

    async fn remove(&self, ctx: &OpContext, id: &str) -> Result<()> {
        match self
            .ssh(ctx, &format!("docker rm -f {}", shell_quote(id)))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_missing_instance() => {
                tracing::info!(host = %self.host.name, instance = id, "容器已不存在，视为删除成功");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn simple(&self, ctx: &OpContext, op: &str, verb: &str, id: &str) -> Result<()> {
        self.require_ssh(op)?;
        self.ssh(ctx, &format!("docker {verb} {}", shell_quote(id)))
            .await?;
        tracing::info!(host = %self.host.name, instance = id, action = verb, "容器状态变更成功");
        Ok(())
    }
}

impl sealed::Sealed for DockerProvider {}

#[async_trait]
impl Provider for DockerProvider {
    fn host_type(&self) -> HostType {
        HostType::Docker
    }

    fn host(&self) -> &Host {
        &self.host
    }

    async fn connect(&self, ctx: &OpContext) -> Result<()> {
        self.require_ssh("连接")?;
        self.ssh(ctx, "docker version --format '{{.Server.Version}}'")
            .await?;
        tracing::info!(host = %self.host.name, "已连接Docker");
        Ok(())
    }

    async fn disconnect(&self) {
        tracing::info!(host = %self.host.name, "断开Docker连接");
    }

    async fn health_check(&self, ctx: &OpContext) -> HealthReport {
        let ssh = self
            .ssh(ctx, "docker version --format '{{.Server.Version}}'")
            .await;
        HealthReport {
            ssh_ok: ssh.is_ok(),
            api_ok: None,
            details: ssh.err().map(|e| format!("ssh: {e}")).unwrap_or_default(),
        }
    }

    async fn list_instances(&self, ctx: &OpContext) -> Result<Vec<InstanceInfo>> {
        self.require_ssh("列出实例")?;
        let out = self
            .ssh(ctx, &format!("docker ps -a --format '{PS_FORMAT}'"))
            .await?;
        Ok(parse_ps(&out))
    }

    async fn get_instance(&self, ctx: &OpContext, id: &str) -> Result<InstanceInfo> {
        self.require_ssh("获取实例")?;
        let out = match self
            .ssh(
                ctx,
                &format!("docker inspect {} --format '{INSPECT_FORMAT}'", shell_quote(id)),
            )
            .await
        {
            Ok(out) => out,
            Err(err) if err.is_missing_instance() => {
                return Err(ControlError::InstanceNotFound(id.to_string()))
            }
            Err(err) => return Err(err),
        };
        let mut info = parse_inspect(&out).map_err(|err| match err {
            ControlError::InstanceNotFound(_) => ControlError::InstanceNotFound(id.to_string()),
            other => other,
        })?;
        info.ipv4 = self.get_instance_ipv4(ctx, id).await?;
        Ok(info)
    }

    async fn create_instance(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: ProgressFn,
    ) -> Result<()> {
        self.require_ssh("创建实例")?;
        progress(10, "准备Docker镜像...");
        self.prepare_image(ctx, config).await?;

        progress(40, "检查网络配置...");
        let ipv6 = config.network_type.has_ipv6() && self.ipv6_network_available(ctx).await?;
        if config.network_type.has_ipv6() && !ipv6 {
            tracing::warn!(host = %self.host.name, "IPv6网络不可用，仅配置IPv4");
        }

        progress(60, "创建容器...");
        self.ssh(ctx, &run_command(config, ipv6)).await?;

        if !config.password.is_empty() {
            progress(80, "配置SSH密码...");
            if let Err(err) = self
                .set_instance_password(ctx, &config.name, &config.password)
                .await
            {
                if err.is_interrupt() {
                    return Err(err);
                }
                tracing::warn!(instance = %config.name, error = %err, "配置SSH密码失败");
            }
        }
        progress(100, "容器创建完成");
        tracing::info!(host = %self.host.name, instance = %config.name, "Docker容器创建成功");
        Ok(())
    }

    async fn start_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.simple(ctx, "启动实例", "start", id).await
    }

    async fn stop_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.simple(ctx, "停止实例", "stop", id).await
    }

    async fn restart_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.simple(ctx, "重启实例", "restart", id).await
    }

    async fn delete_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.require_ssh("删除实例")?;
        with_retries_async(
            ctx,
            DELETE_ATTEMPTS,
            Backoff::Linear(Duration::from_secs(1)),
            is_connection_error,
            |_| self.remove(ctx, id),
        )
        .await
    }

    async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>> {
        self.require_ssh("获取镜像列表")?;
        let out = self
            .ssh(
                ctx,
                "docker images --format '{{.Repository}}|{{.Tag}}|{{.ID}}|{{.Size}}'",
            )
            .await?;
        let images = parse_images(&out);
        tracing::info!(host = %self.host.name, count = images.len(), "获取Docker镜像列表成功");
        Ok(images)
    }

    async fn pull_image(&self, ctx: &OpContext, image: &str) -> Result<()> {
        self.require_ssh("拉取镜像")?;
        self.ssh(ctx, &format!("docker pull {}", shell_quote(image)))
            .await?;
        tracing::info!(host = %self.host.name, image, "Docker镜像拉取成功");
        Ok(())
    }

    async fn delete_image(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.require_ssh("删除镜像")?;
        self.ssh(ctx, &format!("docker rmi -f {}", shell_quote(id)))
            .await?;
        Ok(())
    }

    async fn set_instance_password(
        &self,
        ctx: &OpContext,
        id: &str,
        password: &str,
    ) -> Result<()> {
        self.exec_in_instance(ctx, id, &chpasswd_script(password))
            .await?;
        tracing::info!(host = %self.host.name, instance = id, "容器密码设置成功");
        Ok(())
    }

    async fn get_instance_ipv4(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        let out = self
            .ssh(
                ctx,
                &format!(
                    "docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.IPAddress}}}} {{{{end}}}}' {} 2>/dev/null || true",
                    shell_quote(id)
                ),
            )
            .await?;
        Ok(out.split_whitespace().next().map(str::to_string))
    }

    async fn get_instance_ipv6(&self, ctx: &OpContext, id: &str) -> Result<Ipv6Addresses> {
        let out = self
            .ssh(
                ctx,
                &format!(
                    "docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.GlobalIPv6Address}}}} {{{{end}}}}' {} 2>/dev/null || true",
                    shell_quote(id)
                ),
            )
            .await?;
        let internal = out.split_whitespace().next().map(str::to_string);
        let public = internal
            .clone()
            .filter(|addr| !self.deps.config.ipv6.is_private(addr));
        Ok(Ipv6Addresses { internal, public })
    }

    /// Ports are published when the container is created and cannot be changed afterwards.
    async fn add_port_forward(
        &self,
        _ctx: &OpContext,
        id: &str,
        _private_ip: Option<&str>,
        rule: &PortRule,
        _method: MappingMethod,
    ) -> Result<()> {
        Err(ControlError::InvalidParam(format!(
            "docker container {id}: port {} can only be published at creation",
            rule.host_port
        )))
    }

    async fn remove_port_forward(
        &self,
        _ctx: &OpContext,
        id: &str,
        _private_ip: Option<&str>,
        rule: &PortRule,
        _method: MappingMethod,
    ) -> Result<()> {
        Err(ControlError::InvalidParam(format!(
            "docker container {id}: published port {} requires recreating the container",
            rule.host_port
        )))
    }

    async fn exec_in_instance(&self, ctx: &OpContext, id: &str, script: &str) -> Result<String> {
        self.require_ssh("执行命令")?;
        self.ssh(
            ctx,
            &format!("docker exec {} sh -c {}", shell_quote(id), shell_quote(script)),
        )
        .await
    }
}

#[cfg(test)]
#[path = "docker_tests.rs"]
mod docker_tests;
