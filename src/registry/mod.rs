//! Live adapter handles per host, plus the periodic health probe.

mod health;

pub use health::spawn_health_scheduler;

use crate::config::ControlConfig;
use crate::context::OpContext;
use crate::images::ImageManager;
use crate::models::{Host, HostStatus};
use crate::providers::{self, Provider, ProviderDeps};
use crate::ssh::{RemoteShell, SshClient, SshTarget};
use crate::state::{hosts, StateDatabase};
use crate::{ControlError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Opens the remote shell used to drive a host.
pub trait ShellFactory: Send + Sync {
    fn shell_for(&self, host: &Host) -> Arc<dyn RemoteShell>;
}

/// Password SSH into the host's endpoint.
pub struct SshShellFactory {
    config: Arc<ControlConfig>,
}

impl SshShellFactory {
    pub fn new(config: Arc<ControlConfig>) -> Self {
        Self { config }
    }
}

impl ShellFactory for SshShellFactory {
    fn shell_for(&self, host: &Host) -> Arc<dyn RemoteShell> {
        Arc::new(SshClient::new(SshTarget::from_host(host, &self.config.ssh)))
    }
}

struct Handle {
    provider: Arc<dyn Provider>,
    shell: Arc<dyn RemoteShell>,
}

/// Caches one adapter per host. Handles are built from the host row on first use and dropped
/// when the row changes.
pub struct ProviderRegistry {
    db: StateDatabase,
    config: Arc<ControlConfig>,
    images: Arc<ImageManager>,
    shells: Arc<dyn ShellFactory>,
    handles: Mutex<HashMap<i64, Handle>>,
}

impl ProviderRegistry {
    pub fn new(
        db: StateDatabase,
        config: Arc<ControlConfig>,
        images: Arc<ImageManager>,
        shells: Arc<dyn ShellFactory>,
    ) -> Self {
        Self {
            db,
            config,
            images,
            shells,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, Handle>>> {
        self.handles
            .lock()
            .map_err(|_| ControlError::Internal("provider registry lock poisoned".to_string()))
    }

    fn handle(&self, host_id: i64) -> Result<(Arc<dyn Provider>, Arc<dyn RemoteShell>)> {
        if let Some(h) = self.handles()?.get(&host_id) {
            return Ok((h.provider.clone(), h.shell.clone()));
        }
        let host = self.db.read(|conn| hosts::get(conn, host_id))?;
        let shell = self.shells.shell_for(&host);
        let provider = providers::build(
            host.clone(),
            ProviderDeps {
                shell: shell.clone(),
                images: self.images.clone(),
                config: self.config.clone(),
            },
        );
        tracing::debug!(host = %host.name, host_type = %host.host_type, "创建节点适配器");

        let mut handles = self.handles()?;
        let entry = handles.entry(host_id).or_insert(Handle { provider, shell });
        Ok((entry.provider.clone(), entry.shell.clone()))
    }

    /// Adapter for a host.
    pub fn get(&self, host_id: i64) -> Result<Arc<dyn Provider>> {
        Ok(self.handle(host_id)?.0)
    }

    /// Shell on the host itself, for probes that sit outside the adapter surface.
    pub fn shell(&self, host_id: i64) -> Result<Arc<dyn RemoteShell>> {
        Ok(self.handle(host_id)?.1)
    }

    /// Drop the cached handle so the next use rebuilds it from the current host row.
    pub async fn invalidate(&self, host_id: i64) -> Result<()> {
        let removed = self.handles()?.remove(&host_id);
        if let Some(handle) = removed {
            handle.provider.disconnect().await;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        let drained: Vec<Handle> = self.handles()?.drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.provider.disconnect().await;
        }
        Ok(())
    }

    /// Freeze or unfreeze a host. Frozen hosts reject new work.
    pub async fn set_frozen(&self, host_id: i64, frozen: bool) -> Result<()> {
        self.db.write(|tx| hosts::set_frozen(tx, host_id, frozen))?;
        self.invalidate(host_id).await?;
        tracing::info!(host_id, frozen, "更新节点冻结状态");
        Ok(())
    }

    /// Remove a host that no longer carries instances.
    pub async fn remove_host(&self, host_id: i64) -> Result<()> {
        self.invalidate(host_id).await?;
        self.db.write(|tx| hosts::delete(tx, host_id))?;
        tracing::info!(host_id, "节点已删除");
        Ok(())
    }

    /// Probe one host and record the resulting status.
    pub async fn probe(&self, ctx: &OpContext, host_id: i64) -> Result<HostStatus> {
        let provider = self.get(host_id)?;
        let report = provider.health_check(ctx).await;
        let status = report.status();
        self.db.write(|tx| hosts::set_status(tx, host_id, status))?;
        if status == HostStatus::Active {
            tracing::debug!(host_id, "节点健康检查通过");
        } else {
            tracing::warn!(host_id, %status, details = %report.details, "节点健康检查异常");
        }
        Ok(status)
    }

    /// Probe every host that is not frozen. Failures are logged per host.
    pub async fn probe_all(&self, ctx: &OpContext) -> Result<Vec<(i64, HostStatus)>> {
        let hosts = self.db.read(hosts::list)?;
        let mut results = Vec::new();
        for host in hosts.iter().filter(|h| !h.is_frozen) {
            ctx.check()?;
            match self.probe(ctx, host.id).await {
                Ok(status) => results.push((host.id, status)),
                Err(err) => tracing::warn!(host = %host.name, error = %err, "节点健康检查失败"),
            }
        }
        Ok(results)
    }
}

/// Hands every host the same shell. Used for local single-host setups and tests.
pub struct StaticShellFactory(pub Arc<dyn RemoteShell>);

impl ShellFactory for StaticShellFactory {
    fn shell_for(&self, _host: &Host) -> Arc<dyn RemoteShell> {
        self.0.clone()
    }
}
