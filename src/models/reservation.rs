use super::InstanceType;
use serde::{Deserialize, Serialize};

/// Resource deltas held between admission and the create task's pre-phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub user_id: i64,
    pub host_id: i64,
    pub session_id: String,
    pub instance_type: InstanceType,
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub bandwidth_mbps: i64,
    pub expires_at: i64,
    pub created_at: i64,
}

impl Reservation {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Generate a random 128-bit session identifier.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
