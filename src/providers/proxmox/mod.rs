//! Proxmox VE adapter: `qm` for QEMU guests, `pct` for LXC guests.

pub mod api;
pub mod commands;
mod delete;
pub mod ipv6;

use super::{
    iptables, sealed, HealthReport, ImageInfo, InstanceConfig, InstanceInfo, Ipv6Addresses,
    PortRule, ProgressFn, Provider, ProviderDeps, Selector,
};
use crate::context::OpContext;
use crate::images::{cache_dir, ImageRequest};
use crate::models::{Host, HostType, InstanceType, MappingMethod, NetworkType};
use crate::ssh::shell_quote;
use crate::{ControlError, Result};
use api::ProxmoxApi;
use async_trait::async_trait;
use commands::{CtPlan, Guest, VmPlan};
use ipv6::Ipv6Mode;
use std::collections::BTreeSet;
use std::time::Duration;

pub struct ProxmoxProvider {
    host: Host,
    api: ProxmoxApi,
    selector: Selector,
    deps: ProviderDeps,
}

impl ProxmoxProvider {
    pub fn new(host: Host, deps: ProviderDeps) -> Self {
        let selector = Selector::new(host.name.clone(), host.execution_rule, host.has_api());
        Self {
            api: ProxmoxApi::new(&host),
            host,
            selector,
            deps,
        }
    }

    async fn ssh(&self, ctx: &OpContext, cmd: &str) -> Result<String> {
        self.deps.shell.execute(ctx, cmd).await
    }

    /// Run a step whose failure is logged but does not abort the operation.
    async fn best_effort(&self, ctx: &OpContext, step: &str, cmd: &str) -> Result<()> {
        match self.ssh(ctx, cmd).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_interrupt() => Err(err),
            Err(err) => {
                tracing::warn!(host = %self.host.name, step, error = %err, "步骤执行失败，继续");
                Ok(())
            }
        }
    }

    fn storage(&self) -> &str {
        if self.host.storage_pool.is_empty() {
            "local"
        } else {
            &self.host.storage_pool
        }
    }

    async fn ssh_guests(&self, ctx: &OpContext) -> Result<Vec<Guest>> {
        let mut guests = Vec::new();
        match self.ssh(ctx, "qm list").await {
            Ok(out) => guests.extend(commands::parse_qm_list(&out)),
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => tracing::warn!(host = %self.host.name, error = %err, "获取虚拟机列表失败"),
        }
        match self.ssh(ctx, "pct list").await {
            Ok(out) => guests.extend(commands::parse_pct_list(&out)),
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => tracing::warn!(host = %self.host.name, error = %err, "获取容器列表失败"),
        }
        Ok(guests)
    }

    async fn guests(&self, ctx: &OpContext) -> Result<Vec<Guest>> {
        let api = self.selector.uses_api().then(|| self.api.list_guests(ctx));
        self.selector
            .run("列出实例", api, self.ssh_guests(ctx))
            .await
    }

    /// Find a guest by VMID or name. Containers whose list row lacks a name are matched by
    /// their configured hostname.
    async fn resolve(&self, ctx: &OpContext, id: &str) -> Result<Guest> {
        let guests = self.guests(ctx).await?;
        if let Some(g) = guests
            .iter()
            .find(|g| g.vmid.to_string() == id || g.name == id)
        {
            return Ok(g.clone());
        }
        for g in guests
            .iter()
            .filter(|g| g.kind == InstanceType::Container && g.name == g.vmid.to_string())
        {
            let out = self
                .ssh(ctx, &format!("pct config {} | grep hostname || true", g.vmid))
                .await?;
            if out.split_whitespace().nth(1) == Some(id) {
                return Ok(g.clone());
            }
        }
        Err(ControlError::InstanceNotFound(id.to_string()))
    }

    async fn allocate_vmid(&self, ctx: &OpContext, kind: InstanceType) -> Result<u32> {
        let used: BTreeSet<u32> = self
            .ssh_guests(ctx)
            .await?
            .into_iter()
            .map(|g| g.vmid)
            .collect();
        let vmid = commands::next_vmid(&used, kind)?;
        tracing::info!(host = %self.host.name, instance_type = %kind, vmid, "分配VMID成功");
        Ok(vmid)
    }

    async fn private_ipv4(&self, ctx: &OpContext, guest: &Guest) -> Result<Option<String>> {
        for cmd in commands::ipv4_lookups(guest.kind, guest.vmid) {
            match self.ssh(ctx, &cmd).await {
                Ok(out) if !out.trim().is_empty() => {
                    return Ok(out.lines().next().map(|l| l.trim().to_string()))
                }
                Err(err) if err.is_interrupt() => return Err(err),
                _ => {}
            }
        }
        if guest.kind == InstanceType::Vm {
            let inferred = commands::private_ipv4(guest.vmid);
            if let Ok(out) = self.ssh(ctx, &commands::ping_probe(&inferred)).await {
                if out.trim() == "reachable" {
                    return Ok(Some(inferred));
                }
            }
            ctx.check()?;
        }
        Ok(None)
    }

    async fn internal_ipv6(&self, ctx: &OpContext, guest: &Guest) -> Result<Option<String>> {
        for cmd in commands::ipv6_lookups(guest.kind, guest.vmid) {
            match self.ssh(ctx, &cmd).await {
                Ok(out) => {
                    let addr = out.trim();
                    if !addr.is_empty() && addr != "auto" && addr != "dhcp" {
                        return Ok(Some(addr.to_string()));
                    }
                }
                Err(err) if err.is_interrupt() => return Err(err),
                Err(_) => {}
            }
        }
        Ok(None)
    }

    async fn stage_image(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<String> {
        match config.image_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => {
                self.deps
                    .images
                    .ensure_on_host(
                        ctx,
                        self.deps.shell.as_ref(),
                        &self.host.name,
                        &ImageRequest {
                            name: &config.image,
                            url,
                            architecture: &self.host.architecture,
                            host_type: HostType::Proxmox,
                            instance_type: config.instance_type,
                        },
                    )
                    .await
            }
            None if config.instance_type == InstanceType::Container => {
                self.download_template(ctx, &config.image).await
            }
            None => Err(ControlError::InvalidParam(format!(
                "虚拟机镜像 {} 没有下载地址",
                config.image
            ))),
        }
    }

    /// Fetch a stock LXC template through `pveam`.
    async fn download_template(&self, ctx: &OpContext, template: &str) -> Result<String> {
        let dir = cache_dir(HostType::Proxmox, InstanceType::Container);
        let path = format!("{dir}/{template}");
        let quoted = shell_quote(template);
        self.ssh(
            ctx,
            &format!(
                "[ -s {} ] || {{ pveam update >/dev/null 2>&1; pveam download local {quoted}; }}",
                shell_quote(&path)
            ),
        )
        .await?;
        Ok(path)
    }

    /// IPv6 mode for a new guest. Only `ipv6_only` requires a working IPv6 setup.
    async fn plan_ipv6(&self, ctx: &OpContext, network: NetworkType) -> Result<Option<Ipv6Mode>> {
        if !network.has_ipv6() {
            return Ok(None);
        }
        let mode = ipv6::detect(ctx, self.deps.shell.as_ref()).await?;
        match &mode {
            Ipv6Mode::Unavailable(reason) if network == NetworkType::Ipv6Only => Err(
                ControlError::HostUnavailable(format!("IPv6环境检查失败: {reason}")),
            ),
            Ipv6Mode::Unavailable(reason) => {
                tracing::warn!(host = %self.host.name, reason = %reason, "IPv6环境不可用，仅配置IPv4");
                Ok(None)
            }
            _ => Ok(Some(mode)),
        }
    }

    async fn attach_nat(&self, ctx: &OpContext, mode: &Option<Ipv6Mode>, vmid: u32) -> Result<()> {
        if mode.as_ref() != Some(&Ipv6Mode::Nat) {
            return Ok(());
        }
        let shell = self.deps.shell.as_ref();
        let external = ipv6::claim_external(ctx, shell).await?;
        ipv6::install_nat(ctx, shell, &commands::internal_ipv6(vmid), &external).await
    }

    async fn create_vm(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: &ProgressFn,
    ) -> Result<u32> {
        let vmid = self.allocate_vmid(ctx, InstanceType::Vm).await?;
        progress(20, "准备镜像和资源...");
        let image_path = self.stage_image(ctx, config).await?;

        progress(30, "获取系统架构和KVM支持...");
        let arch = self.ssh(ctx, "uname -m").await?.trim().to_string();
        let kvm = self
            .ssh(ctx, commands::KVM_CHECK)
            .await
            .map(|out| out.trim() == "kvm_available")
            .unwrap_or(false);
        if !kvm {
            tracing::warn!(host = %self.host.name, arch = %arch, "KVM不可用，使用软件模拟");
        }
        let mode = self.plan_ipv6(ctx, config.network_type).await?;
        let plan = VmPlan {
            vmid,
            name: config.name.clone(),
            cores: config.cpu,
            memory_mb: config.memory_mb,
            disk_mb: config.disk_mb,
            storage: self.storage().to_string(),
            image_path,
            arch,
            kvm,
            password: config.password.clone(),
            ipv6: mode.as_ref().and_then(|m| m.interface(vmid)),
            ipv6_only: config.network_type == NetworkType::Ipv6Only,
        };

        progress(40, "创建虚拟机基础配置...");
        self.ssh(ctx, &plan.create()).await?;
        if let Some(bios) = plan.bios() {
            self.ssh(ctx, &bios).await?;
        }
        progress(50, "导入系统镜像到虚拟机...");
        self.ssh(ctx, &plan.import_disk()).await?;

        progress(60, "配置虚拟机磁盘...");
        let mut volid = self.ssh(ctx, &plan.find_volume(true)).await?.trim().to_string();
        if volid.is_empty() {
            volid = self.ssh(ctx, &plan.find_volume(false)).await?.trim().to_string();
        }
        if volid.is_empty() {
            return Err(ControlError::hypervisor("找不到导入的磁盘文件", ""));
        }
        let mut attached = Err(ControlError::hypervisor("设置SCSI磁盘失败", ""));
        for cmd in plan.attach_disk(&volid) {
            attached = self.ssh(ctx, &cmd).await;
            match &attached {
                Ok(_) => break,
                Err(err) if err.is_interrupt() => break,
                Err(_) => {}
            }
        }
        attached?;
        for cmd in plan.boot() {
            self.ssh(ctx, &cmd).await?;
        }

        progress(70, "配置云初始化...");
        self.best_effort(ctx, "cloud-init", &plan.cloud_init()).await?;
        if let Err(err) = self.ssh(ctx, &plan.resize()).await {
            if err.is_interrupt() {
                return Err(err);
            }
            self.best_effort(ctx, "resize", &plan.resize_mb()).await?;
        }

        progress(80, "配置网络...");
        for cmd in plan.ipconfig() {
            self.best_effort(ctx, "ipconfig", &cmd).await?;
        }
        self.best_effort(ctx, "nameserver", &plan.nameserver()).await?;
        self.best_effort(ctx, "credentials", &plan.credentials()).await?;
        self.best_effort(ctx, "name", &plan.rename()).await?;
        self.attach_nat(ctx, &mode, vmid).await?;

        progress(90, "启动虚拟机...");
        self.ssh(ctx, &plan.start()).await?;
        Ok(vmid)
    }

    async fn create_ct(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: &ProgressFn,
    ) -> Result<u32> {
        let vmid = self.allocate_vmid(ctx, InstanceType::Container).await?;
        progress(20, "准备容器系统镜像...");
        let template = self.stage_image(ctx, config).await?;
        let mode = self.plan_ipv6(ctx, config.network_type).await?;
        let plan = CtPlan {
            vmid,
            name: config.name.clone(),
            cores: config.cpu,
            memory_mb: config.memory_mb,
            disk_mb: config.disk_mb,
            storage: self.storage().to_string(),
            template,
            ipv6: mode.as_ref().and_then(|m| m.interface(vmid)),
            ipv6_only: config.network_type == NetworkType::Ipv6Only,
        };

        progress(50, "创建LXC容器...");
        self.ssh(ctx, &plan.create()).await?;

        progress(70, "配置容器网络...");
        for cmd in plan.network() {
            self.best_effort(ctx, "network", &cmd).await?;
        }
        self.attach_nat(ctx, &mode, vmid).await?;

        progress(80, "启动容器...");
        self.ssh(ctx, &plan.start()).await?;
        ctx.sleep(Duration::from_secs(5)).await?;

        progress(85, "配置容器SSH...");
        for cmd in plan.ssh_setup() {
            self.best_effort(ctx, "ssh-setup", &cmd).await?;
        }
        if !config.password.is_empty() {
            self.best_effort(ctx, "password", &commands::chpasswd(vmid, &config.password))
                .await?;
        }
        Ok(vmid)
    }

    fn info(&self, guest: &Guest) -> InstanceInfo {
        InstanceInfo {
            id: guest.vmid.to_string(),
            name: guest.name.clone(),
            status: guest.status,
            instance_type: Some(guest.kind),
            image: None,
            ipv4: None,
            ipv6: None,
        }
    }

    async fn ssh_action(&self, ctx: &OpContext, guest: &Guest, action: &str) -> Result<()> {
        self.ssh(ctx, &commands::action(guest.kind, action, guest.vmid))
            .await
            .map(|_| ())
    }

    async fn change_state(&self, ctx: &OpContext, op: &str, id: &str, action: &str) -> Result<()> {
        let guest = self.resolve(ctx, id).await?;
        let api = self
            .selector
            .uses_api()
            .then(|| self.api.change_state(ctx, &guest, action));
        self.selector
            .run(op, api, self.ssh_action(ctx, &guest, action))
            .await?;
        tracing::info!(host = %self.host.name, vmid = guest.vmid, action, "实例状态变更成功");
        Ok(())
    }

    fn forward<'a>(&self, rule: &PortRule, ip: &'a str) -> iptables::Forward<'a> {
        iptables::Forward {
            interface: Some("vmbr0"),
            protocol: rule.protocol,
            host_port: rule.host_port,
            dest_ip: ip,
            guest_port: rule.guest_port,
        }
    }

    async fn ip_for_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
    ) -> Result<String> {
        if let Some(ip) = private_ip.filter(|ip| !ip.is_empty()) {
            return Ok(ip.to_string());
        }
        let guest = self.resolve(ctx, id).await?;
        self.private_ipv4(ctx, &guest).await?.ok_or_else(|| {
            ControlError::InvalidParam(format!("instance {id} has no private IPv4"))
        })
    }
}

impl sealed::Sealed for ProxmoxProvider {}

#[async_trait]
impl Provider for ProxmoxProvider {
    fn host_type(&self) -> HostType {
        HostType::Proxmox
    }

    fn host(&self) -> &Host {
        &self.host
    }

    async fn connect(&self, ctx: &OpContext) -> Result<()> {
        let api = self.selector.uses_api().then(|| self.api.ping(ctx));
        self.selector
            .run("连接", api, async {
                self.ssh(ctx, "pveversion").await.map(|_| ())
            })
            .await?;
        tracing::info!(host = %self.host.name, "已连接Proxmox");
        Ok(())
    }

    async fn disconnect(&self) {
        tracing::info!(host = %self.host.name, "断开Proxmox连接");
    }

    async fn health_check(&self, ctx: &OpContext) -> HealthReport {
        let ssh = self.ssh(ctx, "pveversion").await;
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
        let guests = self.guests(ctx).await?;
        let vms = guests.iter().filter(|g| g.kind == InstanceType::Vm).count();
        tracing::info!(
            host = %self.host.name,
            total = guests.len(),
            vms,
            containers = guests.len() - vms,
            "获取Proxmox实例列表"
        );
        Ok(guests.iter().map(|g| self.info(g)).collect())
    }

    async fn get_instance(&self, ctx: &OpContext, id: &str) -> Result<InstanceInfo> {
        let guest = self.resolve(ctx, id).await?;
        let mut info = self.info(&guest);
        info.ipv4 = self.private_ipv4(ctx, &guest).await?;
        info.ipv6 = self.internal_ipv6(ctx, &guest).await?;
        Ok(info)
    }

    async fn create_instance(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: ProgressFn,
    ) -> Result<()> {
        // Creation has no API implementation.
        self.selector.run("创建实例", None::<std::future::Ready<Result<()>>>, async {
            progress(10, "开始创建Proxmox实例...");
            let vmid = match config.instance_type {
                InstanceType::Vm => self.create_vm(ctx, config, &progress).await?,
                InstanceType::Container => self.create_ct(ctx, config, &progress).await?,
            };
            progress(100, "Proxmox实例创建完成");
            tracing::info!(
                host = %self.host.name,
                instance = %config.name,
                vmid,
                instance_type = %config.instance_type,
                "Proxmox实例创建成功"
            );
            Ok(())
        })
        .await
    }

    async fn start_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.change_state(ctx, "启动实例", id, "start").await
    }

    async fn stop_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.change_state(ctx, "停止实例", id, "stop").await
    }

    async fn restart_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.change_state(ctx, "重启实例", id, "reboot").await
    }

    async fn delete_instance(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let guest = match self.resolve(ctx, id).await {
            Ok(guest) => guest,
            Err(ControlError::InstanceNotFound(_)) => {
                tracing::info!(host = %self.host.name, instance = id, "实例已不存在，视为删除成功");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.teardown(ctx, &guest).await
    }

    async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>> {
        let api = self.selector.uses_api().then(|| self.api.list_images(ctx));
        let ssh = async {
            let out = self
                .ssh(
                    ctx,
                    "find /root/qcow /var/lib/vz/template/cache -maxdepth 1 -type f \
                     -printf '%p|%s\\n' 2>/dev/null || true",
                )
                .await?;
            Ok::<_, ControlError>(
                out.lines()
                    .filter_map(|line| line.split_once('|'))
                    .filter(|(path, _)| !path.ends_with(".tmp"))
                    .map(|(path, size)| ImageInfo {
                        id: path.to_string(),
                        name: path.rsplit('/').next().unwrap_or(path).to_string(),
                        size: size
                            .trim()
                            .parse::<u64>()
                            .ok()
                            .map(|b| format!("{:.2} MB", b as f64 / 1024.0 / 1024.0)),
                        description: None,
                    })
                    .collect(),
            )
        };
        self.selector.run("获取镜像列表", api, ssh).await
    }

    async fn pull_image(&self, ctx: &OpContext, image: &str) -> Result<()> {
        self.selector.require_path("拉取镜像")?;
        if !(image.starts_with("http://") || image.starts_with("https://")) {
            self.download_template(ctx, image).await?;
            return Ok(());
        }
        let file = image.rsplit('/').next().unwrap_or(image);
        let lower = file.to_ascii_lowercase();
        let instance_type = if [".qcow2", ".img", ".iso", ".raw"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            InstanceType::Vm
        } else {
            InstanceType::Container
        };
        let path = self
            .deps
            .images
            .ensure_on_host(
                ctx,
                self.deps.shell.as_ref(),
                &self.host.name,
                &ImageRequest {
                    name: file,
                    url: image,
                    architecture: &self.host.architecture,
                    host_type: HostType::Proxmox,
                    instance_type,
                },
            )
            .await?;
        tracing::info!(host = %self.host.name, path = %path, "镜像拉取完成");
        Ok(())
    }

    async fn delete_image(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let cmd = if id.starts_with('/') {
            format!("rm -f {}", shell_quote(id))
        } else {
            format!("pvesm free {}", shell_quote(id))
        };
        self.ssh(ctx, &cmd).await.map(|_| ())
    }

    async fn set_instance_password(
        &self,
        ctx: &OpContext,
        id: &str,
        password: &str,
    ) -> Result<()> {
        let guest = self.resolve(ctx, id).await?;
        let running = self
            .ssh(ctx, &commands::status(guest.kind, guest.vmid))
            .await?
            .trim()
            == "running";
        match guest.kind {
            InstanceType::Container => {
                if !running {
                    return Err(ControlError::InvalidParam(format!(
                        "实例 {id} (VMID: {}) 未运行，无法设置密码",
                        guest.vmid
                    )));
                }
                self.ssh(ctx, &commands::chpasswd(guest.vmid, password)).await?;
            }
            InstanceType::Vm => {
                self.ssh(ctx, &commands::set_cipassword(guest.vmid, password)).await?;
                if running {
                    // cloud-init applies the password on the next boot.
                    let reboot = commands::action(guest.kind, "reboot", guest.vmid);
                    self.best_effort(ctx, "reboot", &reboot).await?;
                }
            }
        }
        tracing::info!(
            host = %self.host.name,
            instance = id,
            vmid = guest.vmid,
            "实例密码设置成功"
        );
        Ok(())
    }

    async fn get_instance_ipv4(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        let guest = self.resolve(ctx, id).await?;
        self.private_ipv4(ctx, &guest).await
    }

    async fn get_instance_ipv6(&self, ctx: &OpContext, id: &str) -> Result<Ipv6Addresses> {
        let guest = self.resolve(ctx, id).await?;
        let internal = self.internal_ipv6(ctx, &guest).await?;
        let policy = &self.deps.config.ipv6;
        let public = match &internal {
            Some(addr) if !policy.is_private(addr) => Some(addr.clone()),
            Some(_) => ipv6::nat_external_for(ctx, self.deps.shell.as_ref(), guest.vmid).await?,
            None => None,
        };
        Ok(Ipv6Addresses { internal, public })
    }

    async fn add_port_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
        rule: &PortRule,
        _method: MappingMethod,
    ) -> Result<()> {
        let ip = self.ip_for_forward(ctx, id, private_ip).await?;
        let mut cmds = self.forward(rule, &ip).add_commands();
        cmds.push(iptables::masquerade(&ip));
        cmds.push(iptables::save());
        for cmd in cmds {
            self.ssh(ctx, &cmd).await?;
        }
        tracing::info!(
            host = %self.host.name,
            instance = id,
            host_port = rule.host_port,
            guest_port = rule.guest_port,
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
        _method: MappingMethod,
    ) -> Result<()> {
        let ip = match self.ip_for_forward(ctx, id, private_ip).await {
            Ok(ip) => ip,
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => {
                tracing::warn!(instance = id, error = %err, "无法确定实例IP，跳过端口规则删除");
                return Ok(());
            }
        };
        let mut cmds = self.forward(rule, &ip).delete_commands();
        cmds.push(iptables::save());
        for cmd in cmds {
            self.ssh(ctx, &cmd).await?;
        }
        Ok(())
    }

    async fn exec_in_instance(&self, ctx: &OpContext, id: &str, script: &str) -> Result<String> {
        let guest = self.resolve(ctx, id).await?;
        let out = self
            .ssh(ctx, &commands::exec(guest.kind, guest.vmid, script))
            .await?;
        match guest.kind {
            InstanceType::Container => Ok(out),
            InstanceType::Vm => commands::parse_guest_exec(&out),
        }
    }
}

#[cfg(test)]
#[path = "proxmox_tests.rs"]
mod proxmox_tests;
