//! Uniform capability interface over the supported hypervisors.

pub mod docker;
mod http;
pub mod iptables;
pub mod lxd;
pub mod proxmox;
pub mod selector;
pub mod units;

pub use docker::DockerProvider;
pub use lxd::{LxdFlavor, LxdProvider};
pub use proxmox::ProxmoxProvider;
pub use selector::Selector;

use crate::config::ControlConfig;
use crate::context::OpContext;
use crate::images::ImageManager;
use crate::models::{Host, HostStatus, HostType, InstanceType, MappingMethod, NetworkType, Protocol};
use crate::ssh::{shell_quote, RemoteShell};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Adapter progress callback, `0..=100` plus a short message.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

pub fn no_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

/// A host port forwarded to a guest port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

/// What the adapter needs to build an instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub instance_type: InstanceType,
    pub image: String,
    pub image_url: Option<String>,
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub bandwidth_mbps: i64,
    pub password: String,
    pub network_type: NetworkType,
    /// Forwards known before creation. Docker binds them at create time.
    pub ports: Vec<PortRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl RuntimeStatus {
    pub fn from_raw(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.contains("running") || lower == "up" || lower.starts_with("up ") {
            RuntimeStatus::Running
        } else if lower.contains("stopped") || lower.contains("exited") || lower == "created" {
            RuntimeStatus::Stopped
        } else if lower.contains("paused") || lower.contains("frozen") {
            RuntimeStatus::Paused
        } else {
            RuntimeStatus::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Hypervisor-side identifier (name, vmid or container id).
    pub id: String,
    pub name: String,
    pub status: RuntimeStatus,
    pub instance_type: Option<InstanceType>,
    pub image: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub size: Option<String>,
    pub description: Option<String>,
}

/// IPv6 addressing of an instance. `public` differs from `internal` behind NAT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv6Addresses {
    pub internal: Option<String>,
    pub public: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub ssh_ok: bool,
    /// `None` when no API credentials are configured.
    pub api_ok: Option<bool>,
    pub details: String,
}

impl HealthReport {
    pub fn status(&self) -> HostStatus {
        match (self.ssh_ok, self.api_ok) {
            (true, None) | (true, Some(true)) => HostStatus::Active,
            (true, Some(false)) | (false, Some(true)) => HostStatus::Partial,
            (false, _) => HostStatus::Offline,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Operations every hypervisor adapter supports. Implemented once per hypervisor inside this
/// crate; callers hold `Arc<dyn Provider>` handles from the registry.
#[async_trait]
pub trait Provider: Send + Sync + sealed::Sealed {
    fn host_type(&self) -> HostType;

    fn host(&self) -> &Host;

    /// Verify the host is reachable over its configured paths.
    async fn connect(&self, ctx: &OpContext) -> Result<()>;

    async fn disconnect(&self);

    async fn health_check(&self, ctx: &OpContext) -> HealthReport;

    async fn list_instances(&self, ctx: &OpContext) -> Result<Vec<InstanceInfo>>;

    async fn get_instance(&self, ctx: &OpContext, id: &str) -> Result<InstanceInfo>;

    async fn create_instance(
        &self,
        ctx: &OpContext,
        config: &InstanceConfig,
        progress: ProgressFn,
    ) -> Result<()>;

    async fn start_instance(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn stop_instance(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn restart_instance(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Remove the instance. Missing instances count as success.
    async fn delete_instance(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>>;

    async fn pull_image(&self, ctx: &OpContext, image: &str) -> Result<()>;

    async fn delete_image(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn set_instance_password(&self, ctx: &OpContext, id: &str, password: &str)
        -> Result<()>;

    async fn get_instance_ipv4(&self, ctx: &OpContext, id: &str) -> Result<Option<String>>;

    async fn get_instance_ipv6(&self, ctx: &OpContext, id: &str) -> Result<Ipv6Addresses>;

    /// Install a forward from the host to the instance.
    async fn add_port_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
        rule: &PortRule,
        method: MappingMethod,
    ) -> Result<()>;

    async fn remove_port_forward(
        &self,
        ctx: &OpContext,
        id: &str,
        private_ip: Option<&str>,
        rule: &PortRule,
        method: MappingMethod,
    ) -> Result<()>;

    /// Run a shell script inside the instance.
    async fn exec_in_instance(&self, ctx: &OpContext, id: &str, script: &str) -> Result<String>;
}

/// Everything an adapter needs besides its host row.
#[derive(Clone)]
pub struct ProviderDeps {
    pub shell: Arc<dyn RemoteShell>,
    pub images: Arc<ImageManager>,
    pub config: Arc<ControlConfig>,
}

/// Build the adapter matching the host's type.
pub fn build(host: Host, deps: ProviderDeps) -> Arc<dyn Provider> {
    match host.host_type {
        HostType::Lxd => Arc::new(LxdProvider::new(host, LxdFlavor::Lxd, deps)),
        HostType::Incus => Arc::new(LxdProvider::new(host, LxdFlavor::Incus, deps)),
        HostType::Proxmox => Arc::new(ProxmoxProvider::new(host, deps)),
        HostType::Docker => Arc::new(DockerProvider::new(host, deps)),
    }
}

/// Poll until the instance reports running or `timeout` elapses.
pub async fn wait_until_running(
    provider: &dyn Provider,
    ctx: &OpContext,
    id: &str,
    timeout: std::time::Duration,
) -> Result<()> {
    let wait_ctx = ctx.with_timeout(timeout);
    loop {
        match provider.get_instance(&wait_ctx, id).await {
            Ok(info) if info.status == RuntimeStatus::Running => return Ok(()),
            Ok(_) => {}
            Err(err) if err.is_interrupt() => {}
            Err(err) => tracing::debug!(instance = %id, error = %err, "instance not ready yet"),
        }
        if let Err(err) = wait_ctx.sleep(std::time::Duration::from_secs(2)).await {
            // The outer context decides between a real cancel and a readiness timeout.
            ctx.check()?;
            return Err(crate::ControlError::Timeout(format!(
                "instance {id} did not become ready: {err}"
            )));
        }
    }
}

const VNSTAT_DETECT_SCRIPT: &str =
    "ip -o link show | awk -F': ' '{print $2}' | cut -d'@' -f1 | grep -v '^lo$' | head -n 1";

/// Install vnstat inside the instance and register its primary interface. Returns the interface.
pub async fn init_vnstat(provider: &dyn Provider, ctx: &OpContext, id: &str) -> Result<String> {
    let interface = detect_interface(provider, ctx, id).await?;
    let script = format!(
        "command -v vnstat >/dev/null 2>&1 || (apt-get update -y >/dev/null 2>&1; \
         apt-get install -y vnstat || yum install -y vnstat || apk add vnstat); \
         vnstat --add -i {iface} 2>/dev/null || vnstat -u -i {iface} 2>/dev/null || true; \
         systemctl enable vnstat 2>/dev/null || true; systemctl restart vnstat 2>/dev/null || true",
        iface = shell_quote(&interface)
    );
    provider.exec_in_instance(ctx, id, &script).await?;
    Ok(interface)
}

pub async fn detect_interface(
    provider: &dyn Provider,
    ctx: &OpContext,
    id: &str,
) -> Result<String> {
    let output = provider
        .exec_in_instance(ctx, id, VNSTAT_DETECT_SCRIPT)
        .await?;
    let interface = output.lines().map(str::trim).find(|l| !l.is_empty());
    Ok(interface.unwrap_or("eth0").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_matrix() {
        let report = |ssh_ok, api_ok| HealthReport {
            ssh_ok,
            api_ok,
            details: String::new(),
        };
        assert_eq!(report(true, None).status(), HostStatus::Active);
        assert_eq!(report(true, Some(true)).status(), HostStatus::Active);
        assert_eq!(report(true, Some(false)).status(), HostStatus::Partial);
        assert_eq!(report(false, Some(true)).status(), HostStatus::Partial);
        assert_eq!(report(false, None).status(), HostStatus::Offline);
        assert_eq!(report(false, Some(false)).status(), HostStatus::Offline);
    }

    #[test]
    fn test_runtime_status_parsing() {
        assert_eq!(RuntimeStatus::from_raw("RUNNING"), RuntimeStatus::Running);
        assert_eq!(RuntimeStatus::from_raw("exited"), RuntimeStatus::Stopped);
        assert_eq!(RuntimeStatus::from_raw("Frozen"), RuntimeStatus::Paused);
        assert_eq!(RuntimeStatus::from_raw("weird"), RuntimeStatus::Unknown);
    }
}
