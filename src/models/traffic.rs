use serde::{Deserialize, Serialize};

/// Monthly traffic charged to one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: i64,
    pub user_id: i64,
    pub host_id: i64,
    pub instance_id: i64,
    pub year: i32,
    pub month: u32,
    pub traffic_in_mb: i64,
    pub traffic_out_mb: i64,
    pub total_used_mb: i64,
    pub interface_name: String,
    pub vnstat_version: i64,
    pub last_vnstat_rx_mb: i64,
    pub last_vnstat_tx_mb: i64,
    pub last_sync_at: Option<i64>,
}

/// A sample written by the on-host collector. `day == 0 && hour == 0` marks a monthly rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnstatSample {
    pub instance_id: i64,
    pub interface: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}
