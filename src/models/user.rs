use serde::{Deserialize, Serialize};

string_enum! {
    pub enum UserStatus {
        Active => "active",
        Disabled => "disabled",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub level: i64,
    pub status: UserStatus,
    pub used_quota: i64,
    pub total_quota: i64,
    pub total_traffic_mb: i64,
    pub used_traffic_mb: i64,
    pub traffic_reset_at: Option<i64>,
    pub traffic_limited: bool,
    pub created_at: i64,
}
