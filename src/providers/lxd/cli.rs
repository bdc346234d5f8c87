//! `lxc`/`incus` command construction and output parsing.

use super::LxdFlavor;
use crate::config::Ipv6Policy;
use crate::models::{InstanceType, Protocol};
use crate::providers::units::{disk_arg, memory_arg};
use crate::providers::{ImageInfo, InstanceConfig, InstanceInfo, RuntimeStatus};
use crate::ssh::shell_quote;
use serde::Deserialize;
use std::collections::HashMap;

/// Instance as rendered by `lxc list --format json` and `GET /1.0/instances?recursion=2`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub state: Option<JsonState>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub expanded_devices: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network: Option<HashMap<String, JsonInterface>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonInterface {
    #[serde(default)]
    pub addresses: Vec<JsonAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonAddress {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

fn instance_type_of(kind: &str) -> Option<InstanceType> {
    match kind.to_ascii_lowercase().as_str() {
        "container" => Some(InstanceType::Container),
        "virtual-machine" | "virtual_machine" | "vm" => Some(InstanceType::Vm),
        _ => None,
    }
}

impl JsonInstance {
    fn globals<'a>(&'a self, iface: &str, family: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.state
            .as_ref()
            .and_then(|s| s.network.as_ref())
            .and_then(|n| n.get(iface))
            .into_iter()
            .flat_map(move |i| i.addresses.iter())
            .filter(move |a| a.family == family && a.scope == "global")
            .map(|a| a.address.as_str())
    }

    fn interfaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .state
            .as_ref()
            .and_then(|s| s.network.as_ref())
            .map(|n| n.keys().map(String::as_str).filter(|n| *n != "lo").collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// `eth0` global IPv4 first, then any other interface's global IPv4.
    pub fn ipv4(&self) -> Option<String> {
        if let Some(addr) = self.globals("eth0", "inet").next() {
            return Some(addr.to_string());
        }
        self.interfaces()
            .into_iter()
            .find_map(|iface| self.globals(iface, "inet").next())
            .map(str::to_string)
    }

    /// Public IPv6 on `eth1`, then `eth0`, then the configured `eth1` device address, then any
    /// global address at all.
    pub fn ipv6(&self, policy: &Ipv6Policy) -> Option<String> {
        for iface in ["eth1", "eth0"] {
            if let Some(addr) = self.globals(iface, "inet6").find(|a| !policy.is_private(a)) {
                return Some(addr.to_string());
            }
        }
        let configured = self
            .devices
            .get("eth1")
            .or_else(|| self.expanded_devices.get("eth1"))
            .and_then(|d| d.get("ipv6.address"))
            .filter(|a| !a.is_empty());
        if let Some(addr) = configured {
            return Some(addr.clone());
        }
        self.interfaces()
            .into_iter()
            .find_map(|iface| self.globals(iface, "inet6").next())
            .map(str::to_string)
    }

    pub fn into_info(self, policy: &Ipv6Policy) -> InstanceInfo {
        let raw_status = self
            .state
            .as_ref()
            .map(|s| s.status.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(self.status.as_str());
        InstanceInfo {
            id: self.name.clone(),
            name: self.name.clone(),
            status: RuntimeStatus::from_raw(raw_status),
            instance_type: instance_type_of(&self.kind),
            image: None,
            ipv4: self.ipv4(),
            ipv6: self.ipv6(policy),
        }
    }
}

/// Rows of `list --format csv -c n,s,t`.
pub fn parse_list_csv(output: &str) -> Vec<InstanceInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(InstanceInfo {
                id: fields[0].to_string(),
                name: fields[0].to_string(),
                status: RuntimeStatus::from_raw(fields[1]),
                instance_type: instance_type_of(&fields[2].replace(' ', "-")),
                image: None,
                ipv4: None,
                ipv6: None,
            })
        })
        .collect()
}

/// Fill addresses from `list --format json` output. Unparseable JSON leaves the rows as they are.
pub fn enrich_with_json(instances: &mut [InstanceInfo], json: &str, policy: &Ipv6Policy) {
    let parsed: Vec<JsonInstance> = match serde_json::from_str(json) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(error = %err, "解析实例JSON失败，跳过IP地址获取");
            return;
        }
    };
    let by_name: HashMap<&str, &JsonInstance> =
        parsed.iter().map(|i| (i.name.as_str(), i)).collect();
    for inst in instances.iter_mut() {
        if let Some(json) = by_name.get(inst.name.as_str()) {
            inst.ipv4 = json.ipv4();
            inst.ipv6 = json.ipv6(policy);
        }
    }
}

/// Rows of `image list --format csv -c l,f,s,u`.
pub fn parse_image_csv(output: &str) -> Vec<ImageInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 4 {
                return None;
            }
            let fingerprint = fields[1];
            Some(ImageInfo {
                id: fingerprint.get(..12).unwrap_or(fingerprint).to_string(),
                name: fields[0].to_string(),
                size: Some(fields[2].to_string()),
                description: None,
            })
        })
        .collect()
}

/// Builds commands for one CLI flavour.
#[derive(Debug, Clone, Copy)]
pub struct Cli {
    bin: &'static str,
}

impl Cli {
    pub fn new(flavor: LxdFlavor) -> Self {
        Self {
            bin: flavor.binary(),
        }
    }

    pub fn version(&self) -> String {
        format!("{} version", self.bin)
    }

    pub fn list_csv(&self) -> String {
        format!("{} list --format csv -c n,s,t", self.bin)
    }

    pub fn list_json(&self) -> String {
        format!("{} list --format json", self.bin)
    }

    pub fn init(&self, config: &InstanceConfig) -> String {
        let mut cmd = format!(
            "{} init {} {}",
            self.bin,
            shell_quote(&config.image),
            shell_quote(&config.name)
        );
        if config.instance_type == InstanceType::Vm {
            cmd.push_str(" --vm");
        }
        if config.cpu > 0 {
            cmd.push_str(&format!(" -c limits.cpu={}", config.cpu));
        }
        if config.memory_mb > 0 {
            cmd.push_str(&format!(" -c limits.memory={}", memory_arg(config.memory_mb)));
        }
        if config.disk_mb > 0 {
            cmd.push_str(&format!(" -d root,size={}", disk_arg(config.disk_mb)));
        }
        cmd
    }

    pub fn action(&self, action: &str, id: &str) -> String {
        format!("{} {action} {}", self.bin, shell_quote(id))
    }

    pub fn delete(&self, id: &str) -> String {
        format!("{} delete {} --force", self.bin, shell_quote(id))
    }

    pub fn image_list(&self) -> String {
        format!("{} image list --format csv -c l,f,s,u", self.bin)
    }

    pub fn image_exists(&self, alias: &str) -> String {
        format!("{} image info {} >/dev/null 2>&1 && echo exists", self.bin, shell_quote(alias))
    }

    pub fn image_import(&self, path: &str, alias: &str) -> String {
        format!(
            "{} image import {} --alias {}",
            self.bin,
            shell_quote(path),
            shell_quote(alias)
        )
    }

    pub fn image_copy(&self, image: &str) -> String {
        format!(
            "{} image copy images:{image} local: --alias {}",
            self.bin,
            shell_quote(image)
        )
    }

    pub fn image_delete(&self, id: &str) -> String {
        format!("{} image delete {}", self.bin, shell_quote(id))
    }

    pub fn exec(&self, id: &str, script: &str) -> String {
        format!(
            "{} exec {} -- bash -c {}",
            self.bin,
            shell_quote(id),
            shell_quote(script)
        )
    }

    pub fn chpasswd(&self, id: &str, password: &str) -> String {
        self.exec(id, &chpasswd_script(password))
    }

    pub fn proxy_device_name(host_port: u16, transport: &str) -> String {
        if transport == "tcp" {
            format!("port{host_port}")
        } else {
            format!("port{host_port}-{transport}")
        }
    }

    /// One proxy device per transport.
    pub fn add_proxy(
        &self,
        id: &str,
        host_port: u16,
        guest_port: u16,
        protocol: Protocol,
    ) -> Vec<String> {
        protocol
            .transports()
            .iter()
            .map(|t| {
                format!(
                    "{} config device add {} {} proxy listen={t}:0.0.0.0:{host_port} connect={t}:127.0.0.1:{guest_port}",
                    self.bin,
                    shell_quote(id),
                    Self::proxy_device_name(host_port, t)
                )
            })
            .collect()
    }

    pub fn remove_proxy(&self, id: &str, host_port: u16, protocol: Protocol) -> Vec<String> {
        protocol
            .transports()
            .iter()
            .map(|t| {
                format!(
                    "{} config device remove {} {} 2>/dev/null || true",
                    self.bin,
                    shell_quote(id),
                    Self::proxy_device_name(host_port, t)
                )
            })
            .collect()
    }
}

pub fn chpasswd_script(password: &str) -> String {
    format!("echo \"root:{password}\" | chpasswd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NetworkType;

    fn config(instance_type: InstanceType) -> InstanceConfig {
        InstanceConfig {
            name: "lxd-a-1f2e".into(),
            instance_type,
            image: "ubuntu-22.04".into(),
            image_url: None,
            cpu: 1,
            memory_mb: 512,
            disk_mb: 5000,
            bandwidth_mbps: 300,
            password: "pw".into(),
            network_type: NetworkType::NatIpv4,
            ports: vec![],
        }
    }

    #[test]
    fn test_init_command_for_container_and_vm() {
        let cli = Cli::new(LxdFlavor::Lxd);
        assert_eq!(
            cli.init(&config(InstanceType::Container)),
            "lxc init 'ubuntu-22.04' 'lxd-a-1f2e' -c limits.cpu=1 -c limits.memory=512MiB -d root,size=5000MiB"
        );
        let vm = Cli::new(LxdFlavor::Incus).init(&config(InstanceType::Vm));
        assert!(vm.starts_with("incus init 'ubuntu-22.04' 'lxd-a-1f2e' --vm -c limits.cpu=1"));
    }

    #[test]
    fn test_proxy_devices() {
        let cli = Cli::new(LxdFlavor::Lxd);
        let cmds = cli.add_proxy("c1", 20001, 22, Protocol::Both);
        assert_eq!(
            cmds[0],
            "lxc config device add 'c1' port20001 proxy listen=tcp:0.0.0.0:20001 connect=tcp:127.0.0.1:22"
        );
        assert!(cmds[1].contains("port20001-udp proxy listen=udp:0.0.0.0:20001"));
    }

    #[test]
    fn test_parse_list_csv() {
        let rows = parse_list_csv("web,RUNNING,CONTAINER\nvm1,STOPPED,VIRTUAL-MACHINE\nbad\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, RuntimeStatus::Running);
        assert_eq!(rows[1].instance_type, Some(InstanceType::Vm));
    }

    const LIST_JSON: &str = r#"[{
        "name": "web", "status": "Running", "type": "container",
        "state": {"status": "Running", "network": {
            "lo":   {"addresses": [{"family": "inet", "address": "127.0.0.1", "scope": "local"}]},
            "eth0": {"addresses": [
                {"family": "inet", "address": "10.10.0.5", "scope": "global"},
                {"family": "inet6", "address": "fd42::5", "scope": "global"}]},
            "eth1": {"addresses": [
                {"family": "inet6", "address": "2a01:4f8::5", "scope": "global"}]}
        }},
        "devices": {}
    }, {
        "name": "db", "status": "Stopped", "type": "container",
        "state": {"status": "Stopped", "network": null},
        "devices": {"eth1": {"ipv6.address": "2a01:4f8::9"}}
    }]"#;

    #[test]
    fn test_enrich_prefers_eth0_v4_and_public_v6() {
        let mut rows = parse_list_csv("web,RUNNING,CONTAINER\ndb,STOPPED,CONTAINER\n");
        enrich_with_json(&mut rows, LIST_JSON, &Ipv6Policy::default());
        assert_eq!(rows[0].ipv4.as_deref(), Some("10.10.0.5"));
        assert_eq!(rows[0].ipv6.as_deref(), Some("2a01:4f8::5"));
        assert_eq!(rows[1].ipv4, None);
        assert_eq!(rows[1].ipv6.as_deref(), Some("2a01:4f8::9"));
    }

    #[test]
    fn test_enrich_ignores_garbage() {
        let mut rows = parse_list_csv("web,RUNNING,CONTAINER\n");
        enrich_with_json(&mut rows, "Error: unknown flag", &Ipv6Policy::default());
        assert_eq!(rows[0].ipv4, None);
    }

    #[test]
    fn test_parse_image_csv() {
        let images = parse_image_csv("ubuntu-22.04,0123456789abcdef0123,120.5MiB,Jan 1 2024\n");
        assert_eq!(images[0].id, "0123456789ab");
        assert_eq!(images[0].name, "ubuntu-22.04");
    }
}
