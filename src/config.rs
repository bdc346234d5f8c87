//! Control-plane configuration, loaded from TOML.

use crate::models::InstanceType;
use crate::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub quota: QuotaConfig,
    pub reservation_ttl_secs: u64,
    pub reservation_sweep_interval_secs: u64,
    pub tasks: TaskConfig,
    pub specs: SpecCatalog,
    pub cdn: CdnConfig,
    pub ipv6: Ipv6Policy,
    pub health_interval_secs: u64,
    pub traffic_sync_interval_secs: u64,
    pub ssh: SshSettings,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            reservation_ttl_secs: 600,
            reservation_sweep_interval_secs: 600,
            tasks: TaskConfig::default(),
            specs: SpecCatalog::default(),
            cdn: CdnConfig::default(),
            ipv6: Ipv6Policy::default(),
            health_interval_secs: 300,
            traffic_sync_interval_secs: 600,
            ssh: SshSettings::default(),
        }
    }
}

impl ControlConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ControlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.system_concurrency_cap == 0 {
            return Err(ControlError::InvalidParam(
                "tasks.system_concurrency_cap must be at least 1".to_string(),
            ));
        }
        if self.quota.min_level_for_vm < 1 {
            return Err(ControlError::InvalidParam(
                "quota.min_level_for_vm must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

/// Per-level resource limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelLimits {
    pub max_instances: i64,
    pub max_cpu: i64,
    pub max_memory: i64,
    pub max_disk: i64,
    pub max_bandwidth: i64,
    #[serde(default)]
    pub max_traffic: i64,
}

impl Default for LevelLimits {
    fn default() -> Self {
        Self {
            max_instances: 1,
            max_cpu: 1,
            max_memory: 512,
            max_disk: 10240,
            max_bandwidth: 100,
            max_traffic: 102400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Keyed by user level. TOML tables need string keys, so levels are written as `"1"`, `"2"`.
    pub level_limits: HashMap<String, LevelLimits>,
    pub min_level_for_vm: i64,
    pub min_level_for_container: i64,
    /// Per-user allow-list of instance types, overriding the level gates.
    pub user_instance_type_overrides: HashMap<String, Vec<InstanceType>>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            level_limits: HashMap::new(),
            min_level_for_vm: 2,
            min_level_for_container: 1,
            user_instance_type_overrides: HashMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn limits_for(&self, level: i64) -> LevelLimits {
        self.level_limits
            .get(&level.to_string())
            .copied()
            .unwrap_or_default()
    }

    pub fn allows_instance_type(&self, user_id: i64, level: i64, ty: InstanceType) -> bool {
        if let Some(allowed) = self.user_instance_type_overrides.get(&user_id.to_string()) {
            return allowed.contains(&ty);
        }
        match ty {
            InstanceType::Vm => level >= self.min_level_for_vm,
            InstanceType::Container => level >= self.min_level_for_container,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub system_concurrency_cap: usize,
    pub shutdown_grace_secs: u64,
    pub post_create_boot_wait_secs: u64,
    pub failed_instance_cleanup_delay_secs: u64,
    pub reaper_interval_secs: u64,
    pub cancelling_timeout_secs: u64,
    pub password_retry_sleep_secs: u64,
    pub reset_password_retry_sleep_secs: u64,
    /// How long to wait for an instance to report running after creation.
    pub ready_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            system_concurrency_cap: 10,
            shutdown_grace_secs: 30,
            post_create_boot_wait_secs: 45,
            failed_instance_cleanup_delay_secs: 10,
            reaper_interval_secs: 60,
            cancelling_timeout_secs: 1800,
            password_retry_sleep_secs: 15,
            reset_password_retry_sleep_secs: 5,
            ready_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpecItem {
    pub id: String,
    pub value: i64,
}

impl SpecItem {
    fn new(id: &str, value: i64) -> Self {
        Self {
            id: id.to_string(),
            value,
        }
    }
}

/// Preset resource sizes selectable in a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecCatalog {
    pub cpu: Vec<SpecItem>,
    /// Megabytes.
    pub memory: Vec<SpecItem>,
    /// Megabytes.
    pub disk: Vec<SpecItem>,
    /// Mbps.
    pub bandwidth: Vec<SpecItem>,
}

impl Default for SpecCatalog {
    fn default() -> Self {
        Self {
            cpu: vec![
                SpecItem::new("cpu-1", 1),
                SpecItem::new("cpu-2", 2),
                SpecItem::new("cpu-4", 4),
                SpecItem::new("cpu-8", 8),
            ],
            memory: vec![
                SpecItem::new("mem-512", 512),
                SpecItem::new("mem-1024", 1024),
                SpecItem::new("mem-2048", 2048),
                SpecItem::new("mem-4096", 4096),
                SpecItem::new("mem-8192", 8192),
            ],
            disk: vec![
                SpecItem::new("disk-5000", 5000),
                SpecItem::new("disk-10240", 10240),
                SpecItem::new("disk-20480", 20480),
                SpecItem::new("disk-51200", 51200),
            ],
            bandwidth: vec![
                SpecItem::new("bw-100", 100),
                SpecItem::new("bw-300", 300),
                SpecItem::new("bw-1000", 1000),
            ],
        }
    }
}

fn lookup(items: &[SpecItem], id: &str, what: &str) -> Result<i64> {
    items
        .iter()
        .find(|item| item.id == id)
        .map(|item| item.value)
        .ok_or_else(|| ControlError::InvalidParam(format!("unknown {what} spec: {id}")))
}

impl SpecCatalog {
    pub fn cpu(&self, id: &str) -> Result<i64> {
        lookup(&self.cpu, id, "cpu")
    }

    pub fn memory(&self, id: &str) -> Result<i64> {
        lookup(&self.memory, id, "memory")
    }

    pub fn disk(&self, id: &str) -> Result<i64> {
        lookup(&self.disk, id, "disk")
    }

    pub fn bandwidth(&self, id: &str) -> Result<i64> {
        lookup(&self.bandwidth, id, "bandwidth")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub endpoints: Vec<String>,
    pub test_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Policy {
    pub private_prefixes: Vec<String>,
}

impl Default for Ipv6Policy {
    fn default() -> Self {
        Self {
            private_prefixes: ["fe80:", "fc00:", "fd", "2001:db8:", "::1", "::ffff:"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Ipv6Policy {
    pub fn is_private(&self, addr: &str) -> bool {
        let lower = addr.trim().to_ascii_lowercase();
        self.private_prefixes
            .iter()
            .any(|prefix| lower.starts_with(&prefix.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub exec_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            exec_timeout_secs: 300,
        }
    }
}
