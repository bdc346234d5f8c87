//! Multi-tenant control plane for LXD, Incus, Proxmox VE and Docker hosts.

#[macro_use]
pub mod models;

pub mod config;
pub mod context;
pub mod error;
pub mod images;
pub mod ledger;
pub mod ports;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod service;
pub mod ssh;
pub mod state;
pub mod tasks;
pub mod traffic;

pub use config::ControlConfig;
pub use error::{ControlError, Result};
pub use service::{AddPortRequest, Caller, ControlService, CreateRequest, InstanceAction, TaskView};
pub use state::StateDatabase;
