//! IPv6 addressing for Proxmox guests: NAT through spare host addresses, or direct routing
//! over `vmbr2` with `ndpresponder`.

use super::commands::{internal_ipv6, V6Interface, INTERNAL_V6_GATEWAY};
use crate::context::OpContext;
use crate::ssh::{shell_quote, RemoteShell};
use crate::{ControlError, Result};

pub const APPENDED_FILE: &str = "/usr/local/bin/pve_appended_content.txt";
pub const USED_FILE: &str = "/usr/local/bin/pve_used_vmbr1_ips.txt";
pub const RULES_FILE: &str = "/usr/local/bin/ipv6_nat_rules.sh";
const HOST_V6_FILE: &str = "/usr/local/bin/pve_check_ipv6";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv6Mode {
    /// Spare external addresses are listed in the appended file.
    Nat,
    /// Guests take `<prefix><vmid>` and route through the host address.
    Direct { host_address: String, prefix: String },
    Unavailable(String),
}

impl Ipv6Mode {
    /// Interface settings for a guest, if it gets IPv6 at all.
    pub fn interface(&self, vmid: u32) -> Option<V6Interface> {
        match self {
            Ipv6Mode::Nat => Some(V6Interface {
                bridge: "vmbr1",
                address: internal_ipv6(vmid),
                prefix_len: 64,
                gateway: INTERNAL_V6_GATEWAY.to_string(),
            }),
            Ipv6Mode::Direct {
                host_address,
                prefix,
            } => Some(V6Interface {
                bridge: "vmbr2",
                address: format!("{prefix}{vmid}"),
                prefix_len: 128,
                gateway: host_address.clone(),
            }),
            Ipv6Mode::Unavailable(_) => None,
        }
    }
}

async fn marker(ctx: &OpContext, shell: &dyn RemoteShell, test: &str) -> Result<bool> {
    match shell
        .execute(ctx, &format!("{test} && echo present || true"))
        .await
    {
        Ok(out) => Ok(out.contains("present")),
        Err(err) if err.is_interrupt() => Err(err),
        Err(_) => Ok(false),
    }
}

/// Inspect the host's IPv6 setup.
pub async fn detect(ctx: &OpContext, shell: &dyn RemoteShell) -> Result<Ipv6Mode> {
    if marker(ctx, shell, &format!("[ -s {} ]", shell_quote(APPENDED_FILE))).await? {
        tracing::info!("检测到额外的IPv6地址用于NAT映射");
        return Ok(Ipv6Mode::Nat);
    }
    let host_address = shell
        .execute(ctx, &format!("cat {} 2>/dev/null || true", shell_quote(HOST_V6_FILE)))
        .await?
        .trim()
        .to_string();
    if host_address.is_empty() {
        return Ok(Ipv6Mode::Unavailable(
            "没有IPv6地址用于开设带独立IPv6地址的服务".into(),
        ));
    }
    if !marker(ctx, shell, "grep -q 'vmbr2' /etc/network/interfaces").await? {
        return Ok(Ipv6Mode::Unavailable(
            "没有vmbr2网桥用于开设带独立IPv6地址的服务".into(),
        ));
    }
    if !marker(ctx, shell, "systemctl is-active --quiet ndpresponder.service").await? {
        return Ok(Ipv6Mode::Unavailable(
            "ndpresponder服务状态异常，无法开设带独立IPv6地址的服务".into(),
        ));
    }
    let prefix = match host_address.rsplit_once(':') {
        Some((head, _)) => format!("{head}:"),
        None => {
            return Ok(Ipv6Mode::Unavailable(format!(
                "无法解析主机IPv6地址: {host_address}"
            )))
        }
    };
    Ok(Ipv6Mode::Direct {
        host_address,
        prefix,
    })
}

/// First listed external address not yet handed out.
pub fn pick_external(appended: &str, used: &str) -> Option<String> {
    let used: Vec<&str> = used.lines().map(str::trim).collect();
    appended
        .lines()
        .map(str::trim)
        .find(|ip| !ip.is_empty() && !used.contains(ip))
        .map(str::to_string)
}

/// Reserve an external address by appending it to the used list.
pub async fn claim_external(ctx: &OpContext, shell: &dyn RemoteShell) -> Result<String> {
    let appended = shell
        .execute(ctx, &format!("cat {} 2>/dev/null || true", shell_quote(APPENDED_FILE)))
        .await?;
    let used = shell
        .execute(ctx, &format!("cat {} 2>/dev/null || true", shell_quote(USED_FILE)))
        .await?;
    let ip = pick_external(&appended, &used).ok_or_else(|| {
        ControlError::HostCapacityExceeded("没有可用的IPv6地址用于NAT映射".into())
    })?;
    shell
        .execute(
            ctx,
            &format!("echo {} >> {}", shell_quote(&ip), shell_quote(USED_FILE)),
        )
        .await?;
    Ok(ip)
}

/// The DNAT/SNAT pair binding `external` to `internal`.
pub fn nat_rules(internal: &str, external: &str) -> [String; 2] {
    [
        format!("ip6tables -t nat -A PREROUTING -d {external} -j DNAT --to-destination {internal}"),
        format!("ip6tables -t nat -A POSTROUTING -s {internal} -j SNAT --to-source {external}"),
    ]
}

/// Install the NAT pair and persist it for replay at boot.
pub async fn install_nat(
    ctx: &OpContext,
    shell: &dyn RemoteShell,
    internal: &str,
    external: &str,
) -> Result<()> {
    shell
        .execute(ctx, &format!("touch {}", shell_quote(RULES_FILE)))
        .await?;
    for rule in nat_rules(internal, external) {
        if let Err(err) = shell.execute(ctx, &rule).await {
            if err.is_interrupt() {
                return Err(err);
            }
            tracing::warn!(rule = %rule, error = %err, "添加IPv6 NAT规则失败");
        }
        shell
            .execute(
                ctx,
                &format!("echo {} >> {}", shell_quote(&rule), shell_quote(RULES_FILE)),
            )
            .await?;
    }
    shell
        .execute(
            ctx,
            "systemctl daemon-reload; systemctl restart ipv6nat.service 2>/dev/null || true",
        )
        .await?;
    tracing::info!(internal, external, "IPv6 NAT映射规则配置完成");
    Ok(())
}

/// External address NATed to a guest, read back from the persisted rules.
pub async fn nat_external_for(
    ctx: &OpContext,
    shell: &dyn RemoteShell,
    vmid: u32,
) -> Result<Option<String>> {
    let internal = internal_ipv6(vmid);
    let out = shell
        .execute(
            ctx,
            &format!(
                "grep -- '--to-destination {internal}$' {} 2>/dev/null | \
                 grep -oP '(?<=-d )[^ ]+' | head -1 || true",
                shell_quote(RULES_FILE)
            ),
        )
        .await?;
    let ext = out.trim();
    Ok((!ext.is_empty()).then(|| ext.to_string()))
}

/// Undo a guest's NAT pair and release its external address.
pub async fn release_nat(ctx: &OpContext, shell: &dyn RemoteShell, vmid: u32) -> Result<()> {
    if !marker(ctx, shell, &format!("[ -s {} ]", shell_quote(APPENDED_FILE))).await? {
        return Ok(());
    }
    let Some(external) = nat_external_for(ctx, shell, vmid).await? else {
        return Ok(());
    };
    let internal = internal_ipv6(vmid);
    let rules = shell_quote(RULES_FILE);
    let cmds = [
        format!(
            "ip6tables -t nat -D PREROUTING -d {external} -j DNAT --to-destination {internal} 2>/dev/null || true"
        ),
        format!(
            "ip6tables -t nat -D POSTROUTING -s {internal} -j SNAT --to-source {external} 2>/dev/null || true"
        ),
        format!("sed -i '/--to-destination {internal}$/d' {rules} 2>/dev/null || true"),
        format!("sed -i '/--to-source {external}$/d' {rules} 2>/dev/null || true"),
        format!(
            "sed -i '/^{external}$/d' {} 2>/dev/null || true",
            shell_quote(USED_FILE)
        ),
        "systemctl daemon-reload; systemctl restart ipv6nat.service 2>/dev/null || true".into(),
    ];
    for cmd in cmds {
        shell.execute(ctx, &cmd).await?;
    }
    tracing::info!(vmid, external = %external, "IPv6 NAT规则已清理");
    Ok(())
}
