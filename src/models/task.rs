use super::Protocol;
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum TaskType {
        Create => "create",
        Start => "start",
        Stop => "stop",
        Restart => "restart",
        Delete => "delete",
        Reset => "reset",
        ResetPassword => "reset-password",
        CreatePortMapping => "create-port-mapping",
        DeletePortMapping => "delete-port-mapping",
    }
}

impl TaskType {
    /// Default execution deadline in seconds.
    pub fn default_timeout_secs(&self) -> i64 {
        match self {
            TaskType::Create => 1800,
            TaskType::Start | TaskType::Stop => 300,
            TaskType::Restart => 600,
            TaskType::Reset => 1200,
            TaskType::Delete => 600,
            TaskType::ResetPassword => 600,
            TaskType::CreatePortMapping => 600,
            TaskType::DeletePortMapping => 300,
        }
    }

    /// Whether a user may cancel this kind of task while it runs.
    pub fn is_force_stoppable(&self) -> bool {
        !matches!(self, TaskType::Delete | TaskType::DeletePortMapping)
    }
}

string_enum! {
    pub enum TaskStatus {
        Pending => "pending",
        Processing => "processing",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelling => "cancelling",
        Cancelled => "cancelled",
        Timeout => "timeout",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Statuses a worker is actively executing.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uuid: String,
    pub user_id: i64,
    pub host_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// JSON payload, shape depends on `task_type`.
    pub task_data: String,
    pub progress: u8,
    pub status_message: String,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub timeout_duration_s: i64,
    pub is_force_stoppable: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl Task {
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.task_data)?)
    }

    /// Users may cancel queued or running tasks that allow it.
    pub fn can_cancel(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Running) && self.is_force_stoppable
    }

    /// Administrators may force-stop anything a worker is holding.
    pub fn can_force_stop(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Processing | TaskStatus::Running | TaskStatus::Cancelling
        )
    }

    pub fn remaining_secs(&self, now: i64) -> Option<i64> {
        if !self.status.is_active() {
            return None;
        }
        let started = self.started_at?;
        Some((self.timeout_duration_s - (now - started)).max(0))
    }
}

/// Payload of a `create` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTaskData {
    pub provider_id: i64,
    pub image_id: i64,
    pub cpu_id: String,
    pub memory_id: String,
    pub disk_id: String,
    pub bandwidth_id: String,
    pub session_id: String,
    #[serde(default)]
    pub description: String,
}

/// Payload of instance action tasks (start/stop/restart/delete/reset/reset-password).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceActionData {
    pub instance_id: i64,
    #[serde(default)]
    pub admin: bool,
    /// Set when the traffic aggregator triggers the action.
    #[serde(default)]
    pub traffic_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatePortMappingData {
    pub instance_id: i64,
    pub port_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletePortMappingData {
    pub instance_id: i64,
    pub port_id: i64,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}
