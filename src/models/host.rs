use serde::{Deserialize, Serialize};

string_enum! {
    /// Hypervisor flavour running on a host.
    pub enum HostType {
        Lxd => "lxd",
        Incus => "incus",
        Proxmox => "proxmox",
        Docker => "docker",
    }
}

string_enum! {
    /// Policy choosing between the hypervisor API and the SSH CLI.
    pub enum ExecutionRule {
        Auto => "auto",
        ApiOnly => "api_only",
        SshOnly => "ssh_only",
    }
}

string_enum! {
    pub enum HostStatus {
        Active => "active",
        Partial => "partial",
        Frozen => "frozen",
        Offline => "offline",
    }
}

string_enum! {
    pub enum NetworkType {
        NatIpv4 => "nat_ipv4",
        NatIpv4Ipv6 => "nat_ipv4_ipv6",
        DedicatedIpv4 => "dedicated_ipv4",
        DedicatedIpv4Ipv6 => "dedicated_ipv4_ipv6",
        Ipv6Only => "ipv6_only",
    }
}

string_enum! {
    pub enum MappingMethod {
        Iptables => "iptables",
        Native => "native",
    }
}

impl NetworkType {
    pub fn has_ipv6(&self) -> bool {
        matches!(
            self,
            NetworkType::NatIpv4Ipv6 | NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only
        )
    }

    /// Dedicated addressing and IPv6-only hosts get no automatic port forwards.
    pub fn skips_default_mappings(&self) -> bool {
        matches!(
            self,
            NetworkType::DedicatedIpv4 | NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub host_type: HostType,
    /// `host[:port]` of the hypervisor API; the host part is also the SSH target.
    pub endpoint: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip_serializing, default)]
    pub ssh_password: String,
    pub api_cert_path: Option<String>,
    pub api_key_path: Option<String>,
    #[serde(skip_serializing, default)]
    pub api_token: Option<String>,
    pub api_token_id: Option<String>,
    pub architecture: String,
    pub region: String,
    pub country: String,
    pub execution_rule: ExecutionRule,
    pub status: HostStatus,
    pub allow_claim: bool,
    pub is_frozen: bool,
    pub expires_at: Option<i64>,
    pub node_cpu_cores: i64,
    pub node_memory_mb: i64,
    pub node_disk_mb: i64,
    pub used_cpu_cores: i64,
    pub used_memory_mb: i64,
    pub used_disk_mb: i64,
    pub container_count: i64,
    pub vm_count: i64,
    /// Zero means no cap.
    pub max_container_instances: i64,
    pub max_vm_instances: i64,
    pub container_enabled: bool,
    pub vm_enabled: bool,
    pub max_concurrent_tasks: i64,
    pub allow_concurrent_tasks: bool,
    pub network_type: NetworkType,
    pub ipv4_port_mapping_method: MappingMethod,
    pub ipv6_port_mapping_method: MappingMethod,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub next_available_port: u16,
    pub default_port_count: i64,
    pub default_in_bandwidth_mbps: i64,
    pub default_out_bandwidth_mbps: i64,
    pub max_in_bandwidth_mbps: i64,
    pub max_out_bandwidth_mbps: i64,
    pub max_traffic_mb: i64,
    pub used_traffic_mb: i64,
    pub traffic_reset_at: Option<i64>,
    pub traffic_limited: bool,
    /// Proxmox storage used for disks and volumes.
    pub storage_pool: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Host {
    /// A host with sensible defaults, used by the CLI and tests as a starting point.
    pub fn new(name: impl Into<String>, host_type: HostType, endpoint: impl Into<String>) -> Self {
        let now = super::now_ts();
        Self {
            id: 0,
            name: name.into(),
            host_type,
            endpoint: endpoint.into(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_password: String::new(),
            api_cert_path: None,
            api_key_path: None,
            api_token: None,
            api_token_id: None,
            architecture: "amd64".to_string(),
            region: String::new(),
            country: String::new(),
            execution_rule: ExecutionRule::Auto,
            status: HostStatus::Active,
            allow_claim: true,
            is_frozen: false,
            expires_at: None,
            node_cpu_cores: 0,
            node_memory_mb: 0,
            node_disk_mb: 0,
            used_cpu_cores: 0,
            used_memory_mb: 0,
            used_disk_mb: 0,
            container_count: 0,
            vm_count: 0,
            max_container_instances: 0,
            max_vm_instances: 0,
            container_enabled: true,
            vm_enabled: true,
            max_concurrent_tasks: 1,
            allow_concurrent_tasks: false,
            network_type: NetworkType::NatIpv4,
            ipv4_port_mapping_method: MappingMethod::Iptables,
            ipv6_port_mapping_method: MappingMethod::Iptables,
            port_range_start: 10000,
            port_range_end: 65535,
            next_available_port: 10000,
            default_port_count: 10,
            default_in_bandwidth_mbps: 100,
            default_out_bandwidth_mbps: 100,
            max_in_bandwidth_mbps: 1000,
            max_out_bandwidth_mbps: 1000,
            max_traffic_mb: 0,
            used_traffic_mb: 0,
            traffic_reset_at: None,
            traffic_limited: false,
            storage_pool: "local".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether credentials for the native HTTPS API are configured.
    pub fn has_api(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
        match self.host_type {
            HostType::Lxd | HostType::Incus => {
                present(&self.api_cert_path) && present(&self.api_key_path)
            }
            HostType::Proxmox => present(&self.api_token) && present(&self.api_token_id),
            HostType::Docker => false,
        }
    }

    /// Host part of the endpoint, without any `:port` suffix.
    pub fn address(&self) -> String {
        endpoint_host(&self.endpoint)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| t > 0 && t <= now).unwrap_or(false)
    }

    /// Reasons this host must not accept new work, if any.
    pub fn unavailable_reason(&self, now: i64) -> Option<String> {
        if self.is_frozen || self.status == HostStatus::Frozen {
            return Some(format!("host {} is frozen", self.name));
        }
        if self.is_expired(now) {
            return Some(format!("host {} has expired", self.name));
        }
        if self.status == HostStatus::Offline {
            return Some(format!("host {} is offline", self.name));
        }
        None
    }

    /// Worker count for this host's pool.
    pub fn pool_size(&self, system_cap: usize) -> usize {
        if !self.allow_concurrent_tasks {
            return 1;
        }
        let wanted = self.max_concurrent_tasks.max(1) as usize;
        wanted.min(system_cap.max(1))
    }
}

/// Strip a trailing `:port` unless the value is a bare IPv6 literal.
pub fn endpoint_host(endpoint: &str) -> String {
    let trimmed = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    if trimmed.matches(':').count() > 1 {
        return trimmed.to_string();
    }
    match trimmed.rsplit_once(':') {
        Some((host, _port)) => host.to_string(),
        None => trimmed.to_string(),
    }
}
