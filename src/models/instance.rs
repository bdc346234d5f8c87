use serde::{Deserialize, Serialize};

string_enum! {
    pub enum InstanceType {
        Vm => "vm",
        Container => "container",
    }
}

string_enum! {
    pub enum InstanceStatus {
        Creating => "creating",
        Running => "running",
        Stopped => "stopped",
        Deleting => "deleting",
        Deleted => "deleted",
        Failed => "failed",
    }
}

impl InstanceStatus {
    /// Statuses whose resources count against host capacity and user quota.
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Creating | InstanceStatus::Running | InstanceStatus::Stopped
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Running)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    pub fn can_delete(&self) -> bool {
        !matches!(self, InstanceStatus::Deleting | InstanceStatus::Deleted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub host_id: i64,
    pub user_id: i64,
    pub image_name: String,
    pub image_url: String,
    pub instance_type: InstanceType,
    pub cpu_cores: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub bandwidth_mbps: i64,
    pub status: InstanceStatus,
    pub os_type: String,
    pub username: String,
    pub password: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub ipv6_address: Option<String>,
    pub public_ipv6: Option<String>,
    pub ssh_port: u16,
    pub vnstat_interface: Option<String>,
    pub traffic_limited: bool,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}
