//! LXD and Incus adapter. Both speak the same REST API and near-identical CLIs.

pub mod api;
pub mod cli;

use super::{
    iptables, sealed, wait_until_running, HealthReport, ImageInfo, InstanceConfig, InstanceInfo,
    Ipv6Addresses, PortRule, ProgressFn, Provider, ProviderDeps, Selector,
};
use crate::context::OpContext;
use crate::images::ImageRequest;
use crate::models::{Host, HostType, InstanceType, MappingMethod};
use crate::{ControlError, Result};
use api::LxdApi;
use async_trait::async_trait;
use cli::{enrich_with_json, parse_image_csv, parse_list_csv, Cli, JsonInstance};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LxdFlavor {
    Lxd,
    Incus,
}

impl LxdFlavor {
    pub fn binary(&self) -> &'static str {
        match self {
            LxdFlavor::Lxd => "lxc",
            LxdFlavor::Incus => "incus",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LxdFlavor::Lxd => "LXD",
            LxdFlavor::Incus => "Incus",
        }
    }
}

pub struct LxdProvider {
    host: Host,
    flavor: LxdFlavor,
    cli: Cli,
    api: LxdApi,
    selector: Selector,
    deps: ProviderDeps,
}

impl LxdProvider {
    pub fn new(host: Host, flavor: LxdFlavor, deps: ProviderDeps) -> Self {
        let selector = Selector::new(host.name.clone(), host.execution_rule, host.has_api());
        Self {
            api: LxdApi::new(&host),
            cli: Cli::new(flavor),
            host,
            flavor,
            selector,
            deps,
        }
    }

    async fn ssh(&self, ctx: &OpContext, cmd: &str) -> Result<String> {
        self.deps.shell.execute(ctx, cmd).await
    }

    async fn ssh_list(&self, ctx: &OpContext) -> Result<Vec<InstanceInfo>> {
        let csv = self.ssh(ctx, &self.cli.list_csv()).await?;
        let mut instances = parse_list_csv(&csv);
        match self.ssh(ctx, &self.cli.list_json()).await {
            Ok(json) => enrich_with_json(&mut instances, &json, &self.deps.config.ipv6),
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => tracing::debug!(host = %self.host.name, error = %err, "JSON列表不可用，跳过IP地址获取"),
        }
        tracing::info!(host = %self.host.name, count = instances.len(), "通过SSH获取实例列表");
        Ok(instances)
    }

    async fn ssh_get(&self, ctx: &OpContext, id: &str) -> Result<InstanceInfo> {
        let json = self.ssh(ctx, &self.cli.list_json()).await?;
        let parsed: Vec<JsonInstance> = serde_json::from_str(&json)?;
        parsed
            .into_iter()
            .find(|i| i.name == id)
            .map(|i| i.into_info(&self.deps.config.ipv6))
            .ok_or_else(|| ControlError::InstanceNotFound(id.to_string()))
    }

    /// Stage the image on the host and make sure the CLI knows it under `config.image`.
    async fn prepare_image(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<()> {
        let exists = matches!(
            self.ssh(ctx, &self.cli.image_exists(&config.image)).await,
            Ok(out) if out.contains("exists")
        );
        ctx.check()?;
        if exists {
            tracing::info!(host = %self.host.name, image = %config.image, "镜像已导入，跳过");
            return Ok(());
        }
        match config.image_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => {
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
                            host_type: self.host.host_type,
                            instance_type: config.instance_type,
                        },
                    )
                    .await?;
                self.ssh(ctx, &self.cli.image_import(&path, &config.image))
                    .await?;
            }
            None => {
                self.ssh(ctx, &self.cli.image_copy(&config.image)).await?;
            }
        }
        Ok(())
    }

    async fn ssh_create(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<()> {
        self.ssh(ctx, &self.cli.init(config)).await?;
        self.ssh(ctx, &self.cli.action("start", &config.name)).await?;
        Ok(())
    }

    async fn api_create(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<()> {
        self.api.create(ctx, config).await?;
        self.api.change_state(ctx, &config.name, "start").await
    }

    async fn ssh_delete(&self, ctx: &OpContext, id: &str) -> Result<()> {
        match self.ssh(ctx, &self.cli.delete(id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_missing_instance() => {
                tracing::info!(host = %self.host.name, instance = id, "实例已不存在，视为删除成功");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn ssh_exec(&self, ctx: &OpContext, id: &str, script: &str) -> Result<String> {
        self.ssh(ctx, &self.cli.exec(id, script)).await
    }

    fn api_path(&self) -> bool {
        self.selector.uses_api()
    }
}

impl sealed::Sealed for LxdProvider {}

#[async_trait]
impl Provider for LxdProvider {
    fn host_type(&self) -> HostType {
        self.host.host_type
    }

    fn host(&self) -> &Host {
        &self.host
    }

    async fn connect(&self, ctx: &OpContext) -> Result<()> {
        let api = self.api_path().then(|| self.api.ping(ctx));
        self.selector
            .run("连接", api, async {
                self.ssh(ctx, &self.cli.version()).await.map(|_| ())
            })
            .await?;
        tracing::info!(host = %self.host.name, flavor = self.flavor.label(), "已连接");
        Ok(())
    }

    async fn disconnect(&self) {
        tracing::info!(host = %self.host.name, flavor = self.flavor.label(), "断开连接");
    }

    async fn health_check(&self, ctx: &OpContext) -> HealthReport {
        let ssh = self.ssh(ctx, &self.cli.version()).await;
        let api = if self.host.has_api() {
            Some(self.api.ping(ctx).await)
        } else {
            None
        };
        let mut details = Vec::new();
        if let Err(err) = &ssh {
            details.push(format!("ssh: {err}"));
        }
        if let Some(Err(err)) = &api {
            details.push(format!("api: {err}"));
        }
        HealthReport {
            ssh_ok: ssh.is_ok(),
            api_ok: api.map(|r| r.is_ok()),
            details: details.join("; "),
        }
    }

    async fn list_instances(&self, ctx: &OpContext) -> Result<Vec<InstanceInfo>> {
        let api = self.api_path().then(|| async {
            let list = self.api.list_instances(ctx).await?;
            let infos: Vec<InstanceInfo> = list
                .into_iter()
                .map(|i| i.into_info(&self.deps.config.ipv6))
                .collect();
            Ok::<_, ControlError>(infos)
        });
        self.selector
            .run("列出实例", api, self.ssh_list(ctx))
            .await
    }

    async fn get_instance(&self, ctx: &OpContext, id: &str) -> Result<InstanceInfo> {
        let api = self.api_path().then(|| async {
            let inst = self.api.get_instance(ctx, id).await?;
            Ok::<_, ControlError>(inst.into_info(&self.deps.config.ipv6))
        });
        self.selector
            .run("获取实例", api, self.ssh_get(ctx, id))
            .await
    }

    async fn create_instance(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: ProgressFn,
    ) -> Result<()> {
        self.selector.require_path("创建实例")?;
        progress(10, "处理镜像下载和导入...");
        self.prepare_image(ctx, config).await?;

        progress(30, "初始化实例...");
        let api = self.api_path().then(|| self.api_create(ctx, config));
        self.selector
            .run("创建实例", api, self.ssh_create(ctx, config))
            .await?;

        progress(60, "等待实例就绪...");
        let ready = Duration::from_secs(self.deps.config.tasks.ready_timeout_secs);
        match wait_until_running(self, ctx, &config.name, ready).await {
            Ok(()) => {}
            Err(err) if matches!(err, ControlError::Cancelled(_)) => return Err(err),
            Err(err) => tracing::warn!(instance = %config.name, error = %err, "等待实例就绪失败，但继续"),
        }

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

        progress(100, "实例创建完成");
        tracing::info!(host = %self.host.name, instance = %config.name, "实例创建成功");
        Ok(())
    }

    async fn start_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let api = self
            .api_path()
            .then(|| self.api.change_state(ctx, id, "start"));
        let ssh = async { self.ssh(ctx, &self.cli.action("start", id)).await.map(|_| ()) };
        self.selector.run("启动实例", api, ssh).await
    }

    async fn stop_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let api = self.api_path().then(|| self.api.change_state(ctx, id, "stop"));
        let ssh = async { self.ssh(ctx, &self.cli.action("stop", id)).await.map(|_| ()) };
        self.selector.run("停止实例", api, ssh).await
    }

    async fn restart_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let api = self
            .api_path()
            .then(|| self.api.change_state(ctx, id, "restart"));
        let ssh = async {
            self.ssh(ctx, &self.cli.action("restart", id))
                .await
                .map(|_| ())
        };
        self.selector.run("重启实例", api, ssh).await
    }

    async fn delete_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let api = self.api_path().then(|| self.api.delete(ctx, id));
        self.selector
            .run("删除实例", api, self.ssh_delete(ctx, id))
            .await
    }

    async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>> {
        let api = self.api_path().then(|| self.api.list_images(ctx));
        let ssh = async {
            let out = self.ssh(ctx, &self.cli.image_list()).await?;
            Ok::<_, ControlError>(parse_image_csv(&out))
        };
        self.selector.run("获取镜像列表", api, ssh).await
    }

    async fn pull_image(&self, ctx: &OpContext, image: &str) -> Result<()> {
        if image.starts_with("http://") || image.starts_with("https://") {
            let file = image
                .rsplit('/')
                .next()
                .unwrap_or(image)
                .split('?')
                .next()
                .unwrap_or_default();
            let alias = file
                .trim_end_matches(".tar.xz")
                .trim_end_matches(".tar.gz")
                .trim_end_matches(".zip")
                .to_string();
            let config = InstanceConfig {
                name: String::new(),
                instance_type: InstanceType::Container,
                image: alias,
                image_url: Some(image.to_string()),
                cpu: 0,
                memory_mb: 0,
                disk_mb: 0,
                bandwidth_mbps: 0,
                password: String::new(),
                network_type: self.host.network_type,
                ports: Vec::new(),
            };
            return self.prepare_image(ctx, &config).await;
        }
        let api = self.api_path().then(|| self.api.pull_image(ctx, image));
        let ssh = async { self.ssh(ctx, &self.cli.image_copy(image)).await.map(|_| ()) };
        self.selector.run("拉取镜像", api, ssh).await
    }

    async fn delete_image(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let api = self.api_path().then(|| self.api.delete_image(ctx, id));
        let ssh = async { self.ssh(ctx, &self.cli.image_delete(id)).await.map(|_| ()) };
        self.selector.run("删除镜像", api, ssh).await
    }

    async fn set_instance_password(
        &self,
        ctx: &OpContext,
        id: &str,
        password: &str,
    ) -> Result<()> {
        let api = self
            .api_path()
            .then(|| self.api.set_password(ctx, id, password));
        let ssh = async {
            self.ssh(ctx, &self.cli.chpasswd(id, password))
                .await
                .map(|_| ())
        };
        self.selector.run("设置实例密码", api, ssh).await?;
        tracing::info!(host = %self.host.name, instance = id, "实例密码设置成功");
        Ok(())
    }

    async fn get_instance_ipv4(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        Ok(self.get_instance(ctx, id).await?.ipv4)
    }

    async fn get_instance_ipv6(&self, ctx: &OpContext, id: &str) -> Result<Ipv6Addresses> {
        let internal = self.get_instance(ctx, id).await?.ipv6;
        let public = internal
            .clone()
            .filter(|addr| !self.deps.config.ipv6.is_private(addr));
        Ok(Ipv6Addresses { internal, public })
    }

    async fn add_port_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
        rule: &PortRule,
        method: MappingMethod,
    ) -> Result<()> {
        let commands = match method {
            MappingMethod::Native => {
                self.cli
                    .add_proxy(id, rule.host_port, rule.guest_port, rule.protocol)
            }
            MappingMethod::Iptables => {
                let ip = private_ip.ok_or_else(|| {
                    ControlError::InvalidParam(format!("instance {id} has no private IPv4"))
                })?;
                let forward = iptables::Forward {
                    interface: None,
                    protocol: rule.protocol,
                    host_port: rule.host_port,
                    dest_ip: ip,
                    guest_port: rule.guest_port,
                };
                let mut cmds = forward.add_commands();
                cmds.push(iptables::masquerade(ip));
                cmds.push(iptables::save());
                cmds
            }
        };
        for cmd in commands {
            self.ssh(ctx, &cmd).await?;
        }
        tracing::info!(
            host = %self.host.name,
            instance = id,
            host_port = rule.host_port,
            guest_port = rule.guest_port,
            method = %method,
            "端口映射已添加"
        );
        Ok(())
    }

    async fn remove_port_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
        rule: &PortRule,
        method: MappingMethod,
    ) -> Result<()> {
        let commands = match (method, private_ip) {
            (MappingMethod::Native, _) => self.cli.remove_proxy(id, rule.host_port, rule.protocol),
            (MappingMethod::Iptables, Some(ip)) => {
                let mut cmds = iptables::Forward {
                    interface: None,
                    protocol: rule.protocol,
                    host_port: rule.host_port,
                    dest_ip: ip,
                    guest_port: rule.guest_port,
                }
                .delete_commands();
                cmds.push(iptables::save());
                cmds
            }
            (MappingMethod::Iptables, None) => Vec::new(),
        };
        for cmd in commands {
            self.ssh(ctx, &cmd).await?;
        }
        Ok(())
    }

    async fn exec_in_instance(&self, ctx: &OpContext, id: &str, script: &str) -> Result<String> {
        let api = self.api_path().then(|| self.api.exec(ctx, id, script));
        self.selector
            .run("执行命令", api, self.ssh_exec(ctx, id, script))
            .await
    }
}

#[cfg(test)]
#[path = "lxd_tests.rs"]
mod lxd_tests;
