use super::MappingMethod;
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum Protocol {
        Tcp => "tcp",
        Udp => "udp",
        /// One rule per transport.
        Both => "both",
    }
}

impl Protocol {
    /// Concrete transports a rule has to be installed for.
    pub fn transports(&self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }
}

string_enum! {
    pub enum PortStatus {
        Active => "active",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: i64,
    pub instance_id: i64,
    pub host_id: i64,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub description: String,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub ipv6_enabled: bool,
    pub status: PortStatus,
    pub mapping_method: MappingMethod,
    pub created_at: i64,
}
