use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use fleet_control::models::{ExecutionRule, HostType, MappingMethod, NetworkType, Protocol};
use fleet_control::{ControlConfig, ControlService, InstanceAction, StateDatabase};
use std::path::PathBuf;
use std::sync::Arc;

mod cli;

#[derive(Parser)]
#[command(name = "fleet-control")]
#[command(about = "Control plane for LXD, Incus, Proxmox and Docker hosts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory override
    #[arg(long, global = true, env = "FLEET_CONTROL_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Config file (defaults to config.toml in the state directory)
    #[arg(long, global = true, env = "FLEET_CONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (table or json)
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task workers, reaper, health probe and traffic sync until Ctrl+C
    Serve,

    /// Manage hosts
    #[command(subcommand)]
    Host(HostCommands),

    /// Manage users
    #[command(subcommand)]
    User(UserCommands),

    /// Manage system images
    #[command(subcommand)]
    Image(ImageCommands),

    /// Manage instances
    #[command(subcommand)]
    Instance(InstanceCommands),

    /// Manage port mappings
    #[command(subcommand)]
    Port(PortCommands),

    /// Inspect and cancel tasks
    #[command(subcommand)]
    Task(TaskCommands),

    /// Run one traffic aggregation pass
    TrafficSync,
}

#[derive(Subcommand)]
pub enum HostCommands {
    /// Register a host
    Add {
        name: String,
        /// lxd, incus, proxmox or docker
        #[arg(long = "type")]
        host_type: HostType,
        /// Address, optionally with :port
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value = "root")]
        ssh_user: String,
        #[arg(long, env = "FLEET_CONTROL_SSH_PASSWORD", default_value = "")]
        ssh_password: String,
        #[arg(long, default_value = "22")]
        ssh_port: u16,
        /// auto, api_only or ssh_only
        #[arg(long, default_value = "auto")]
        execution_rule: ExecutionRule,
        #[arg(long, default_value = "nat_ipv4")]
        network_type: NetworkType,
        #[arg(long, default_value = "iptables")]
        mapping_method: MappingMethod,
        #[arg(long, default_value = "0")]
        cpu: i64,
        /// Node memory (e.g. 16G, 8192M)
        #[arg(long, default_value = "0")]
        memory: String,
        /// Node disk (e.g. 500G)
        #[arg(long, default_value = "0")]
        disk: String,
        #[arg(long, default_value = "10000")]
        port_start: u16,
        #[arg(long, default_value = "65535")]
        port_end: u16,
        #[arg(long, default_value = "10")]
        default_ports: i64,
        #[arg(long)]
        api_cert: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        api_token_id: Option<String>,
        #[arg(long, env = "FLEET_CONTROL_API_TOKEN")]
        api_token: Option<String>,
        #[arg(long, default_value = "local")]
        storage_pool: String,
        /// Monthly traffic cap in MB, 0 for none
        #[arg(long, default_value = "0")]
        max_traffic_mb: i64,
        /// Let several tasks run on the host at once
        #[arg(long)]
        concurrent_tasks: Option<i64>,
    },
    /// List hosts
    List,
    /// Stop scheduling work on a host
    Freeze { id: i64 },
    /// Accept work on a host again
    Unfreeze { id: i64 },
    /// Recompute a host's resource counters
    Resync { id: i64 },
    /// Probe a host now
    Probe { id: i64 },
    /// Show port usage on a host
    Ports { id: i64 },
    /// Remove a host that carries no instances
    Remove { id: i64 },
}

#[derive(Subcommand)]
pub enum UserCommands {
    Add {
        username: String,
        #[arg(long, default_value = "1")]
        level: i64,
        /// Monthly traffic in MB, 0 to use the level default
        #[arg(long, default_value = "0")]
        traffic_mb: i64,
    },
    List,
    /// Recompute a user's weighted quota from live instances
    Recalc { id: i64 },
}

#[derive(Subcommand)]
pub enum ImageCommands {
    Add {
        name: String,
        #[arg(long)]
        url: String,
        /// Comma separated host types, e.g. lxd,incus
        #[arg(long)]
        providers: String,
        /// vm or container
        #[arg(long, default_value = "container")]
        instance_type: fleet_control::models::InstanceType,
        #[arg(long, default_value = "linux")]
        os_type: String,
        #[arg(long, default_value = "")]
        os_version: String,
        #[arg(long, default_value = "amd64")]
        arch: String,
    },
    List,
}

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// Request a new instance and wait for it
    Create {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        host: i64,
        #[arg(long)]
        image: i64,
        #[arg(long, default_value = "cpu-1")]
        cpu: String,
        #[arg(long, default_value = "mem-512")]
        memory: String,
        #[arg(long, default_value = "disk-10240")]
        disk: String,
        #[arg(long, default_value = "bw-100")]
        bandwidth: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List a user's instances
    List { user: i64 },
    /// start, stop, restart, delete or reset
    Action { id: i64, action: InstanceAction },
    ResetPassword { id: i64 },
}

#[derive(Subcommand)]
pub enum PortCommands {
    Add {
        instance: i64,
        guest_port: u16,
        /// Host port, picked from the host range when omitted
        #[arg(long)]
        host_port: Option<u16>,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
        #[arg(long, default_value = "")]
        description: String,
    },
    Remove { id: i64 },
    List { instance: i64 },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    List {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long)]
        host: Option<i64>,
        #[arg(long)]
        status: Option<fleet_control::models::TaskStatus>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        page_size: u32,
    },
    Show { id: i64 },
    Cancel {
        id: i64,
        #[arg(long, default_value = "用户取消")]
        reason: String,
    },
    ForceCancel {
        id: i64,
        #[arg(long, default_value = "管理员强制停止")]
        reason: String,
    },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => ProjectDirs::from("dev", "fleet", "fleet-control")
            .context("Failed to determine project directory")?
            .data_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;

    let config_path = cli.config.unwrap_or_else(|| state_dir.join("config.toml"));
    let config = ControlConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db = StateDatabase::new(&state_dir.join("state.db"))
        .context("Failed to open state database")?;
    let service = ControlService::new(db, Arc::new(config));
    let json = cli.format == "json";

    let outcome = match cli.command {
        Commands::Serve => cli::serve(&service).await,
        Commands::Host(cmd) => cli::hosts::execute(&service, cmd, json).await,
        Commands::User(cmd) => cli::users::execute(&service, cmd, json),
        Commands::Image(cmd) => cli::users::execute_image(&service, cmd, json),
        Commands::Instance(cmd) => cli::instances::execute(&service, cmd, json).await,
        Commands::Port(cmd) => cli::instances::execute_port(&service, cmd, json).await,
        Commands::Task(cmd) => cli::tasks::execute(&service, cmd, json),
        Commands::TrafficSync => cli::tasks::traffic_sync(&service, json),
    };

    service.shutdown().await;
    outcome
}
