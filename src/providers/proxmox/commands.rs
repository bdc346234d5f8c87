//! `qm`/`pct` command builders and output parsers.

use crate::models::InstanceType;
use crate::providers::units::disk_gb;
use crate::providers::RuntimeStatus;
use crate::ssh::shell_quote;
use crate::{ControlError, Result};
use std::collections::BTreeSet;

pub const PRIVATE_GATEWAY: &str = "172.16.1.1";
pub const INTERNAL_V6_GATEWAY: &str = "2001:db8:1::1";

pub fn tool(kind: InstanceType) -> &'static str {
    match kind {
        InstanceType::Vm => "qm",
        InstanceType::Container => "pct",
    }
}

/// VMIDs reserved for each instance type.
pub fn vmid_range(kind: InstanceType) -> (u32, u32) {
    match kind {
        InstanceType::Vm => (100, 177),
        InstanceType::Container => (178, 255),
    }
}

/// Private IPv4 of a guest on `vmbr1`.
pub fn private_ipv4(vmid: u32) -> String {
    format!("172.16.1.{vmid}")
}

/// Internal IPv6 of a guest behind the host's IPv6 NAT.
pub fn internal_ipv6(vmid: u32) -> String {
    format!("2001:db8:1::{vmid}")
}

/// A row from `qm list` or `pct list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub vmid: u32,
    pub name: String,
    pub status: RuntimeStatus,
    pub kind: InstanceType,
}

/// `qm list`: VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID.
pub fn parse_qm_list(output: &str) -> Vec<Guest> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            Some(Guest {
                vmid: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                status: status_of(fields[2]),
                kind: InstanceType::Vm,
            })
        })
        .collect()
}

/// `pct list`: VMID Status [Lock] Name. The lock column is usually empty.
pub fn parse_pct_list(output: &str) -> Vec<Guest> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            let name = match fields.len() {
                2 => fields[0],
                3 => fields[2],
                _ => fields[3],
            };
            Some(Guest {
                vmid: fields[0].parse().ok()?,
                name: name.to_string(),
                status: status_of(fields[1]),
                kind: InstanceType::Container,
            })
        })
        .collect()
}

fn status_of(raw: &str) -> RuntimeStatus {
    if raw == "running" {
        RuntimeStatus::Running
    } else {
        RuntimeStatus::Stopped
    }
}

/// Smallest VMID in the type's range not used by any VM or container.
pub fn next_vmid(used: &BTreeSet<u32>, kind: InstanceType) -> Result<u32> {
    let (min, max) = vmid_range(kind);
    (min..=max).find(|id| !used.contains(id)).ok_or_else(|| {
        ControlError::HostCapacityExceeded(format!(
            "no free VMID in {min}-{max} for {kind}"
        ))
    })
}

pub fn is_arm(arch: &str) -> bool {
    matches!(arch.trim(), "aarch64" | "armv7l" | "armv8" | "armv8l" | "arm64")
}

/// CPU model and KVM flag for `qm create`.
pub fn cpu_model(arch: &str, kvm: bool) -> (&'static str, &'static str) {
    if kvm {
        return ("host", "--kvm 1");
    }
    let cpu = match arch.trim() {
        a if is_arm(a) => "max",
        "i386" | "i686" | "x86" => "qemu32",
        _ => "qemu64",
    };
    (cpu, "--kvm 0")
}

pub const KVM_CHECK: &str =
    "[ -e /dev/kvm ] && [ -r /dev/kvm ] && [ -w /dev/kvm ] && echo 'kvm_available' || echo 'kvm_unavailable'";

/// Addressing of the guest's IPv6 interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V6Interface {
    pub bridge: &'static str,
    pub address: String,
    pub prefix_len: u8,
    pub gateway: String,
}

impl V6Interface {
    fn ip6_arg(&self) -> String {
        format!("ip6={}/{},gw6={}", self.address, self.prefix_len, self.gateway)
    }
}

/// Everything needed to build one QEMU guest.
#[derive(Debug, Clone)]
pub struct VmPlan {
    pub vmid: u32,
    pub name: String,
    pub cores: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub storage: String,
    pub image_path: String,
    pub arch: String,
    pub kvm: bool,
    pub password: String,
    /// Present when the guest gets IPv6.
    pub ipv6: Option<V6Interface>,
    /// IPv6 is the only address family; it then lives on `net0`.
    pub ipv6_only: bool,
}

impl VmPlan {
    pub fn create(&self) -> String {
        let (cpu, kvm) = cpu_model(&self.arch, self.kvm);
        let nets = match (&self.ipv6, self.ipv6_only) {
            (Some(v6), true) => format!("--net0 virtio,bridge={}", v6.bridge),
            (Some(v6), false) => {
                format!("--net0 virtio,bridge=vmbr1 --net1 virtio,bridge={}", v6.bridge)
            }
            (None, _) => "--net0 virtio,bridge=vmbr1".to_string(),
        };
        format!(
            "qm create {} --agent 1 --scsihw virtio-scsi-single --serial0 socket --cores {} \
             --sockets 1 --cpu {cpu} {nets} --ostype l26 {kvm}",
            self.vmid,
            self.cores.max(1)
        )
    }

    pub fn bios(&self) -> Option<String> {
        is_arm(&self.arch).then(|| format!("qm set {} --bios ovmf", self.vmid))
    }

    pub fn import_disk(&self) -> String {
        format!(
            "qm importdisk {} {} {}",
            self.vmid,
            shell_quote(&self.image_path),
            self.storage
        )
    }

    /// Locate the imported volume, preferring raw images.
    pub fn find_volume(&self, raw_only: bool) -> String {
        let filter = if raw_only { " && $1 ~ /\\.raw$/" } else { "" };
        format!(
            "pvesm list {} | awk -v vmid=\"{}\" '$5 == vmid{filter} {{print $1}}' | tail -n 1",
            self.storage, self.vmid
        )
    }

    /// Candidate commands attaching the imported disk as `scsi0`; the first that succeeds wins.
    pub fn attach_disk(&self, volid: &str) -> [String; 2] {
        [
            format!(
                "qm set {id} --scsihw virtio-scsi-pci --scsi0 {s}:{id}/vm-{id}-disk-0.raw",
                id = self.vmid,
                s = self.storage
            ),
            format!("qm set {} --scsihw virtio-scsi-pci --scsi0 {volid}", self.vmid),
        ]
    }

    pub fn boot(&self) -> Vec<String> {
        vec![
            format!("qm set {} --bootdisk scsi0", self.vmid),
            format!("qm set {} --boot order=scsi0", self.vmid),
            format!("qm set {} --memory {}", self.vmid, self.memory_mb),
        ]
    }

    pub fn cloud_init(&self) -> String {
        let slot = if is_arm(&self.arch) { "scsi1" } else { "ide1" };
        format!("qm set {} --{slot} {}:cloudinit", self.vmid, self.storage)
    }

    pub fn resize(&self) -> String {
        format!("qm resize {} scsi0 {}G", self.vmid, disk_gb(self.disk_mb))
    }

    pub fn resize_mb(&self) -> String {
        format!("qm resize {} scsi0 {}M", self.vmid, self.disk_mb)
    }

    pub fn ipconfig(&self) -> Vec<String> {
        match (&self.ipv6, self.ipv6_only) {
            (Some(v6), true) => vec![format!("qm set {} --ipconfig0 {}", self.vmid, v6.ip6_arg())],
            (v6, _) => {
                let mut cmds = vec![format!(
                    "qm set {} --ipconfig0 ip={}/24,gw={PRIVATE_GATEWAY}",
                    self.vmid,
                    private_ipv4(self.vmid)
                )];
                if let Some(v6) = v6 {
                    cmds.push(format!("qm set {} --ipconfig1 {}", self.vmid, v6.ip6_arg()));
                }
                cmds
            }
        }
    }

    pub fn nameserver(&self) -> String {
        let servers = if self.ipv6_only {
            "2001:4860:4860::8888"
        } else {
            "8.8.8.8"
        };
        format!("qm set {} --nameserver {servers}", self.vmid)
    }

    pub fn credentials(&self) -> String {
        format!(
            "qm set {} --cipassword {} --ciuser root",
            self.vmid,
            shell_quote(&self.password)
        )
    }

    pub fn rename(&self) -> String {
        format!("qm set {} --name {}", self.vmid, shell_quote(&self.name))
    }

    pub fn start(&self) -> String {
        format!("qm start {}", self.vmid)
    }
}

/// Everything needed to build one LXC guest.
#[derive(Debug, Clone)]
pub struct CtPlan {
    pub vmid: u32,
    pub name: String,
    pub cores: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub storage: String,
    pub template: String,
    pub ipv6: Option<V6Interface>,
    pub ipv6_only: bool,
}

impl CtPlan {
    pub fn create(&self) -> String {
        format!(
            "pct create {} {} -cores {} -memory {} -swap 128 -rootfs {}:{} -onboot 1 \
             -features nesting=1 -hostname {}",
            self.vmid,
            shell_quote(&self.template),
            self.cores.max(1),
            self.memory_mb,
            self.storage,
            disk_gb(self.disk_mb),
            shell_quote(&self.name)
        )
    }

    pub fn network(&self) -> Vec<String> {
        let v4 = format!(
            "pct set {} --net0 name=eth0,ip={}/24,bridge=vmbr1,gw={PRIVATE_GATEWAY}",
            self.vmid,
            private_ipv4(self.vmid)
        );
        let v6 = |slot: u8, iface: &str, v6: &V6Interface| {
            format!(
                "pct set {} --net{slot} name={iface},ip6={}/{},bridge={},gw6={}",
                self.vmid, v6.address, v6.prefix_len, v6.bridge, v6.gateway
            )
        };
        let nameserver = |servers: &str| format!("pct set {} --nameserver '{servers}'", self.vmid);
        match (&self.ipv6, self.ipv6_only) {
            (Some(addr), true) => vec![
                v6(0, "eth0", addr),
                nameserver("2001:4860:4860::8888 2001:4860:4860::8844"),
            ],
            (Some(addr), false) => vec![
                v4,
                v6(1, "eth1", addr),
                nameserver("8.8.8.8 8.8.4.4 2001:4860:4860::8888 2001:4860:4860::8844"),
            ],
            (None, _) => vec![v4],
        }
    }

    pub fn start(&self) -> String {
        format!("pct start {}", self.vmid)
    }

    /// Enable password SSH for root inside the container.
    pub fn ssh_setup(&self) -> Vec<String> {
        [
            "apt-get update -y",
            "apt-get install -y openssh-server curl",
            "systemctl enable ssh",
            "sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config",
            "sed -i 's/^#\\?PasswordAuthentication.*/PasswordAuthentication yes/' /etc/ssh/sshd_config",
            "systemctl restart ssh",
        ]
        .iter()
        .map(|step| format!("pct exec {} -- bash -c {}", self.vmid, shell_quote(step)))
        .collect()
    }
}

pub fn status(kind: InstanceType, vmid: u32) -> String {
    format!(
        "{} status {vmid} 2>/dev/null | grep -w 'status:' | awk '{{print $2}}'",
        tool(kind)
    )
}

pub fn action(kind: InstanceType, action: &str, vmid: u32) -> String {
    format!("{} {action} {vmid}", tool(kind))
}

/// Candidate commands yielding the guest's private IPv4, tried in order.
pub fn ipv4_lookups(kind: InstanceType, vmid: u32) -> Vec<String> {
    let from_config = format!(
        "{} config {vmid} | grep -oP 'ip=\\K[0-9.]+' || true",
        tool(kind)
    );
    match kind {
        InstanceType::Container => vec![
            from_config,
            format!("pct exec {vmid} -- hostname -I | awk '{{print $1}}' || true"),
        ],
        InstanceType::Vm => vec![
            from_config,
            format!(
                "qm guest cmd {vmid} network-get-interfaces 2>/dev/null | \
                 grep -oP '\"ip-address\":\\s*\"\\K[^\"]+' | grep -E '^(172\\.|192\\.|10\\.)' | head -1 || true"
            ),
        ],
    }
}

/// Last resort for VMs: the conventional address if it answers a ping.
pub fn ping_probe(ip: &str) -> String {
    format!("ping -c 1 -W 2 {ip} >/dev/null 2>&1 && echo 'reachable' || echo 'unreachable'")
}

/// Candidate commands yielding the guest's configured IPv6, tried in order.
pub fn ipv6_lookups(kind: InstanceType, vmid: u32) -> Vec<String> {
    match kind {
        InstanceType::Container => vec![
            format!(
                "pct config {vmid} | grep -E 'net[0-9]+:.*ip6=' | \
                 sed -n 's/.*ip6=\\([^/,[:space:]]*\\).*/\\1/p' | head -1"
            ),
            format!(
                "pct exec {vmid} -- ip -6 addr show | grep 'inet6.*global' | awk '{{print $2}}' | \
                 cut -d'/' -f1 | head -1 || true"
            ),
        ],
        InstanceType::Vm => vec![format!(
            "qm config {vmid} | grep -E 'ipconfig[0-9]+:.*ip6=' | \
             sed -n 's/.*ip6=\\([^/,[:space:]]*\\).*/\\1/p' | head -1"
        )],
    }
}

/// Run a script inside the guest.
pub fn exec(kind: InstanceType, vmid: u32, script: &str) -> String {
    match kind {
        InstanceType::Container => format!("pct exec {vmid} -- bash -c {}", shell_quote(script)),
        InstanceType::Vm => format!("qm guest exec {vmid} -- bash -c {}", shell_quote(script)),
    }
}

/// `qm guest exec` wraps the script's output in JSON.
pub fn parse_guest_exec(output: &str) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct GuestExec {
        #[serde(default)]
        exitcode: i64,
        #[serde(rename = "out-data", default)]
        out_data: String,
        #[serde(rename = "err-data", default)]
        err_data: String,
    }
    let parsed: GuestExec = serde_json::from_str(output.trim())?;
    if parsed.exitcode != 0 {
        return Err(ControlError::hypervisor(
            format!("guest command exited with status {}", parsed.exitcode),
            format!("{}{}", parsed.out_data, parsed.err_data),
        ));
    }
    Ok(parsed.out_data)
}

pub fn chpasswd(vmid: u32, password: &str) -> String {
    exec(
        InstanceType::Container,
        vmid,
        &crate::providers::lxd::cli::chpasswd_script(password),
    )
}

pub fn set_cipassword(vmid: u32, password: &str) -> String {
    format!("qm set {vmid} --cipassword {}", shell_quote(password))
}

/// Steps run after `destroy`, all best effort.
pub fn volume_cleanup(vmid: u32) -> String {
    format!(
        "for s in $(pvesm status | awk 'NR > 1 {{print $1}}'); do \
         for v in $(pvesm list \"$s\" | awk -v vmid='{vmid}' '$5 == vmid {{print $1}}'); do \
         p=$(pvesm path \"$v\" 2>/dev/null); [ -n \"$p\" ] && [ -e \"$p\" ] && rm -rf \"$p\"; \
         done; done; true"
    )
}

pub fn work_dir_cleanup(kind: InstanceType, vmid: u32) -> String {
    let prefix = match kind {
        InstanceType::Vm => "vm",
        InstanceType::Container => "ct",
    };
    format!("rm -rf /root/{prefix}{vmid}")
}

pub const NDP_RESTART: &str =
    "[ -f /usr/local/bin/ndpresponder ] && systemctl restart ndpresponder.service || true";

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_plan(ipv6: Option<V6Interface>) -> VmPlan {
        VmPlan {
            vmid: 101,
            name: "pve-a-1f2e".into(),
            cores: 2,
            memory_mb: 1024,
            disk_mb: 20480,
            storage: "local".into(),
            image_path: "/root/qcow/abc.qcow2".into(),
            arch: "x86_64".into(),
            kvm: true,
            password: "pw".into(),
            ipv6,
            ipv6_only: false,
        }
    }

    fn nat_v6(vmid: u32) -> V6Interface {
        V6Interface {
            bridge: "vmbr1",
            address: internal_ipv6(vmid),
            prefix_len: 64,
            gateway: INTERNAL_V6_GATEWAY.into(),
        }
    }

    #[test]
    fn test_lists_and_vmid_allocation() {
        let qm = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n\
                  \x20      100 pve-a-0001           running    1024              20.00 4242\n\
                  \x20      102 pve-a-0002           stopped    512               10.00 0\n";
        let pct = "VMID       Status     Lock         Name\n178        running                 ct-one\n";
        let vms = parse_qm_list(qm);
        let cts = parse_pct_list(pct);
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].status, RuntimeStatus::Running);
        assert_eq!(cts[0].name, "ct-one");

        let used: BTreeSet<u32> = vms.iter().chain(&cts).map(|g| g.vmid).collect();
        assert_eq!(next_vmid(&used, InstanceType::Vm).unwrap(), 101);
        assert_eq!(next_vmid(&used, InstanceType::Container).unwrap(), 179);

        let full: BTreeSet<u32> = (100..=177).collect();
        assert!(matches!(
            next_vmid(&full, InstanceType::Vm),
            Err(ControlError::HostCapacityExceeded(_))
        ));
    }

    #[test]
    fn test_cpu_model_without_kvm() {
        assert_eq!(cpu_model("x86_64", true), ("host", "--kvm 1"));
        assert_eq!(cpu_model("x86_64", false), ("qemu64", "--kvm 0"));
        assert_eq!(cpu_model("aarch64", false), ("max", "--kvm 0"));
        assert_eq!(cpu_model("i686", false), ("qemu32", "--kvm 0"));
    }

    #[test]
    fn test_vm_plan_with_nat_ipv6() {
        let plan = vm_plan(Some(nat_v6(101)));
        assert!(plan
            .create()
            .contains("--net0 virtio,bridge=vmbr1 --net1 virtio,bridge=vmbr1"));
        let ip = plan.ipconfig();
        assert_eq!(ip[0], "qm set 101 --ipconfig0 ip=172.16.1.101/24,gw=172.16.1.1");
        assert_eq!(
            ip[1],
            "qm set 101 --ipconfig1 ip6=2001:db8:1::101/64,gw6=2001:db8:1::1"
        );
        assert_eq!(plan.cloud_init(), "qm set 101 --ide1 local:cloudinit");
        assert_eq!(plan.resize(), "qm resize 101 scsi0 20G");
        assert!(plan.bios().is_none());
    }

    #[test]
    fn test_vm_plan_ipv4_only_and_arm() {
        let mut plan = vm_plan(None);
        plan.arch = "aarch64".into();
        assert!(!plan.create().contains("--net1"));
        assert_eq!(plan.ipconfig().len(), 1);
        assert_eq!(plan.cloud_init(), "qm set 101 --scsi1 local:cloudinit");
        assert_eq!(plan.bios().unwrap(), "qm set 101 --bios ovmf");
    }

    #[test]
    fn test_ct_plan() {
        let plan = CtPlan {
            vmid: 180,
            name: "pve-a-beef".into(),
            cores: 1,
            memory_mb: 512,
            disk_mb: 5000,
            storage: "local-lvm".into(),
            template: "/var/lib/vz/template/cache/x.tar.xz".into(),
            ipv6: Some(nat_v6(180)),
            ipv6_only: true,
        };
        assert!(plan
            .create()
            .contains("-swap 128 -rootfs local-lvm:5 -onboot 1 -features nesting=1"));
        let net = plan.network();
        assert_eq!(
            net[0],
            "pct set 180 --net0 name=eth0,ip6=2001:db8:1::180/64,bridge=vmbr1,gw6=2001:db8:1::1"
        );
    }

    #[test]
    fn test_parse_guest_exec() {
        let ok = r#"{"exitcode": 0, "exited": 1, "out-data": "eth0\n"}"#;
        assert_eq!(parse_guest_exec(ok).unwrap(), "eth0\n");
        let bad = r#"{"exitcode": 2, "exited": 1, "err-data": "boom"}"#;
        assert!(parse_guest_exec(bad).is_err());
    }
}
