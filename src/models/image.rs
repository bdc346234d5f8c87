use super::{Host, HostType, InstanceType};
use crate::{ControlError, Result};
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum ImageStatus {
        Active => "active",
        Inactive => "inactive",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub os_type: String,
    pub os_version: String,
    pub architecture: String,
    /// Comma separated list of host types that can run this image.
    pub provider_type: String,
    pub instance_type: InstanceType,
    pub url: String,
    pub status: ImageStatus,
    pub description: String,
    pub created_at: i64,
}

impl Image {
    pub fn supports(&self, host_type: HostType) -> bool {
        self.provider_type
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(host_type.as_str()))
    }

    /// Whether this image may be deployed on `host`: active, built for its hypervisor and for
    /// its architecture. Hosts without a recorded architecture count as amd64.
    pub fn check_host(&self, host: &Host) -> Result<()> {
        if self.status != ImageStatus::Active || !self.supports(host.host_type) {
            return Err(ControlError::InvalidParam(format!(
                "image {} is not available on {} hosts",
                self.name, host.host_type
            )));
        }
        let arch = match host.architecture.trim() {
            "" => "amd64",
            arch => arch,
        };
        if !self.architecture.trim().eq_ignore_ascii_case(arch) {
            return Err(ControlError::InvalidParam(format!(
                "image {} is built for {}, host {} is {arch}",
                self.name, self.architecture, host.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_csv_provider_types() {
        let image = Image {
            id: 1,
            name: "ubuntu-22.04".into(),
            os_type: "ubuntu".into(),
            os_version: "22.04".into(),
            architecture: "amd64".into(),
            provider_type: "lxd, incus".into(),
            instance_type: InstanceType::Container,
            url: String::new(),
            status: ImageStatus::Active,
            description: String::new(),
            created_at: 0,
        };
        assert!(image.supports(HostType::Incus));
        assert!(!image.supports(HostType::Proxmox));
    }

    #[test]
    fn test_check_host_matches_architecture() {
        let mut image = Image {
            id: 1,
            name: "ubuntu-22.04".into(),
            os_type: "ubuntu".into(),
            os_version: "22.04".into(),
            architecture: "arm64".into(),
            provider_type: "lxd".into(),
            instance_type: InstanceType::Container,
            url: String::new(),
            status: ImageStatus::Active,
            description: String::new(),
            created_at: 0,
        };
        let mut host = Host::new("lxd-a", HostType::Lxd, "10.0.0.1");
        host.architecture = String::new();
        assert!(matches!(
            image.check_host(&host),
            Err(ControlError::InvalidParam(_))
        ));

        image.architecture = "amd64".into();
        assert!(image.check_host(&host).is_ok());

        host.architecture = "arm64".into();
        assert!(image.check_host(&host).is_err());

        host.architecture = "amd64".into();
        image.status = ImageStatus::Inactive;
        assert!(image.check_host(&host).is_err());
    }
}
