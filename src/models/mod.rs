//! Persistent entities and their closed enumerations.

/// Declares a closed enum persisted and serialised as a lower-case string.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::ControlError;

            fn from_str(s: &str) -> crate::Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::ControlError::InvalidParam(format!(
                        "unknown {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: crate::ControlError| {
                        rusqlite::types::FromSqlError::Other(e.to_string().into())
                    })
            }
        }
    };
}

pub mod host;
pub mod image;
pub mod instance;
pub mod port;
pub mod reservation;
pub mod task;
pub mod traffic;
pub mod user;

pub use host::{ExecutionRule, Host, HostStatus, HostType, MappingMethod, NetworkType};
pub use image::{Image, ImageStatus};
pub use instance::{Instance, InstanceStatus, InstanceType};
pub use port::{PortMapping, PortStatus, Protocol};
pub use reservation::{new_session_id, Reservation};
pub use task::{
    CreatePortMappingData, CreateTaskData, DeletePortMappingData, InstanceActionData, Task,
    TaskStatus, TaskType,
};
pub use traffic::{TrafficRecord, VnstatSample};
pub use user::{User, UserStatus};

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
