//! Guest teardown. Only the destroy step is fatal; every other step is best effort so a
//! half-created guest can always be removed.

use super::commands::{self, Guest};
use super::{ipv6, ProxmoxProvider};
use crate::context::OpContext;
use crate::models::InstanceType;
use crate::providers::iptables;
use crate::Result;
use std::time::Duration;

const STOP_POLLS: usize = 5;

impl ProxmoxProvider {
    pub(super) async fn teardown(&self, ctx: &OpContext, guest: &Guest) -> Result<()> {
        let vmid = guest.vmid;
        let tool = commands::tool(guest.kind);
        tracing::info!(host = %self.host.name, vmid, instance_type = %guest.kind, "开始删除Proxmox实例");

        let ip = match guest.kind {
            InstanceType::Vm => Some(commands::private_ipv4(vmid)),
            InstanceType::Container => self.private_ipv4(ctx, guest).await?,
        };

        self.best_effort(ctx, "unlock", &format!("{tool} unlock {vmid} 2>/dev/null || true"))
            .await?;
        if let Some(ip) = &ip {
            self.best_effort(ctx, "flush-forwards", &iptables::flush_ip(ip))
                .await?;
        }
        self.best_effort(ctx, "stop", &format!("{tool} stop {vmid} 2>/dev/null || true"))
            .await?;
        for _ in 0..STOP_POLLS {
            let status = self
                .ssh(ctx, &commands::status(guest.kind, vmid))
                .await
                .unwrap_or_default();
            if status.trim() != "running" {
                break;
            }
            ctx.sleep(Duration::from_secs(1)).await?;
        }

        let api = self.selector.uses_api().then(|| self.api.destroy(ctx, guest));
        let ssh = async {
            self.ssh(ctx, &format!("{tool} destroy {vmid} --purge"))
                .await
                .map(|_| ())
        };
        self.selector.run("删除实例", api, ssh).await?;

        if let Err(err) = ipv6::release_nat(ctx, self.deps.shell.as_ref(), vmid).await {
            if err.is_interrupt() {
                return Err(err);
            }
            tracing::warn!(vmid, error = %err, "清理IPv6 NAT规则失败");
        }
        self.best_effort(ctx, "volumes", &commands::volume_cleanup(vmid))
            .await?;
        self.best_effort(ctx, "work-dir", &commands::work_dir_cleanup(guest.kind, vmid))
            .await?;
        if let Some(ip) = &ip {
            self.best_effort(ctx, "persisted-rules", &iptables::purge_ip(ip))
                .await?;
        }
        self.best_effort(ctx, "ndpresponder", commands::NDP_RESTART)
            .await?;

        tracing::info!(host = %self.host.name, vmid, "Proxmox实例删除完成");
        Ok(())
    }
}
