//! Builders shared by unit tests across modules.

use super::StateDatabase;
use crate::models::{Instance, InstanceStatus, InstanceType};
use tempfile::TempDir;

pub fn temp_db() -> (StateDatabase, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = StateDatabase::new(&temp_dir.path().join("state.db")).unwrap();
    (db, temp_dir)
}

pub fn instance(host_id: i64, user_id: i64, name: &str) -> Instance {
    Instance {
        id: 0,
        name: name.to_string(),
        host_id,
        user_id,
        image_name: "ubuntu-22.04".into(),
        image_url: String::new(),
        instance_type: InstanceType::Container,
        cpu_cores: 1,
        memory_mb: 512,
        disk_mb: 5000,
        bandwidth_mbps: 100,
        status: InstanceStatus::Running,
        os_type: "ubuntu".into(),
        username: "root".into(),
        password: "pw".into(),
        public_ip: None,
        private_ip: None,
        ipv6_address: None,
        public_ipv6: None,
        ssh_port: 22,
        vnstat_interface: None,
        traffic_limited: false,
        expires_at: None,
        created_at: 0,
        updated_at: 0,
        deleted_at: None,
    }
}
