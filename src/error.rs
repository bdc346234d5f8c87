use thiserror::Error;

/// Hypervisor output attached to errors is capped at this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 500;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("InvalidParam: {0}")]
    InvalidParam(String),

    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    #[error("QuotaExceeded: {0}")]
    QuotaExceeded(String),

    #[error("HostUnavailable: {0}")]
    HostUnavailable(String),

    #[error("HostCapacityExceeded: {0}")]
    HostCapacityExceeded(String),

    #[error("HostConcurrencyExceeded: {0}")]
    HostConcurrencyExceeded(String),

    #[error("{message}: {output}")]
    Hypervisor { message: String, output: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Port mapping not found: {0}")]
    PortMappingNotFound(i64),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("No ports available in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

/// Stable error categories surfaced through a task's `error_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParam,
    PermissionDenied,
    QuotaExceeded,
    HostUnavailable,
    HostCapacityExceeded,
    HostConcurrencyExceeded,
    Hypervisor,
    Timeout,
    Cancelled,
    NotFound,
    Internal,
}

impl ControlError {
    /// Build a hypervisor error, truncating the captured output.
    pub fn hypervisor(message: impl Into<String>, output: impl AsRef<str>) -> Self {
        ControlError::Hypervisor {
            message: message.into(),
            output: truncate_output(output.as_ref()).to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::InvalidParam(_) | ControlError::InvalidStateTransition { .. } => {
                ErrorKind::InvalidParam
            }
            ControlError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ControlError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            ControlError::HostUnavailable(_) => ErrorKind::HostUnavailable,
            ControlError::HostCapacityExceeded(_) | ControlError::NoPortsAvailable { .. } => {
                ErrorKind::HostCapacityExceeded
            }
            ControlError::HostConcurrencyExceeded(_) => ErrorKind::HostConcurrencyExceeded,
            ControlError::Hypervisor { .. }
            | ControlError::Ssh(_)
            | ControlError::Http(_) => ErrorKind::Hypervisor,
            ControlError::Timeout(_) => ErrorKind::Timeout,
            ControlError::Cancelled(_) => ErrorKind::Cancelled,
            ControlError::HostNotFound(_)
            | ControlError::UserNotFound(_)
            | ControlError::ImageNotFound(_)
            | ControlError::InstanceNotFound(_)
            | ControlError::TaskNotFound(_)
            | ControlError::PortMappingNotFound(_)
            | ControlError::ReservationNotFound(_) => ErrorKind::NotFound,
            ControlError::Database(_)
            | ControlError::Io(_)
            | ControlError::Serialization(_)
            | ControlError::Config(_)
            | ControlError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// SQLite busy/locked conditions are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// True when a hypervisor reports the target instance as already gone.
    pub fn is_missing_instance(&self) -> bool {
        if matches!(self, ControlError::InstanceNotFound(_)) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        [
            "not found",
            "no such container",
            "no such object",
            "already removed",
            "does not exist",
        ]
        .iter()
        .any(|needle| text.contains(needle))
    }

    /// Whether the error came from cancellation or a deadline, which must never be retried
    /// through another execution path.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, ControlError::Cancelled(_) | ControlError::Timeout(_))
    }
}

pub fn truncate_output(output: &str) -> &str {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output;
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    &output[..end]
}

pub type Result<T> = std::result::Result<T, ControlError>;
