use super::format;
use crate::HostCommands;
use anyhow::{Context, Result};
use fleet_control::context::OpContext;
use fleet_control::models::Host;
use fleet_control::providers::units::parse_size_mb;
use fleet_control::ControlService;
use serde_json::json;
use std::time::Duration;

pub async fn execute(service: &ControlService, cmd: HostCommands, json: bool) -> Result<()> {
    match cmd {
        HostCommands::Add {
            name,
            host_type,
            endpoint,
            ssh_user,
            ssh_password,
            ssh_port,
            execution_rule,
            network_type,
            mapping_method,
            cpu,
            memory,
            disk,
            port_start,
            port_end,
            default_ports,
            api_cert,
            api_key,
            api_token_id,
            api_token,
            storage_pool,
            max_traffic_mb,
            concurrent_tasks,
        } => {
            let mut host = Host::new(&name, host_type, endpoint);
            host.ssh_user = ssh_user;
            host.ssh_password = ssh_password;
            host.ssh_port = ssh_port;
            host.execution_rule = execution_rule;
            host.network_type = network_type;
            host.ipv4_port_mapping_method = mapping_method;
            host.node_cpu_cores = cpu;
            host.node_memory_mb = parse_size_mb(&memory)?;
            host.node_disk_mb = parse_size_mb(&disk)?;
            host.port_range_start = port_start;
            host.port_range_end = port_end;
            host.next_available_port = port_start;
            host.default_port_count = default_ports;
            host.api_cert_path = api_cert;
            host.api_key_path = api_key;
            host.api_token_id = api_token_id;
            host.api_token = api_token;
            host.storage_pool = storage_pool;
            host.max_traffic_mb = max_traffic_mb;
            if let Some(n) = concurrent_tasks {
                host.allow_concurrent_tasks = n > 1;
                host.max_concurrent_tasks = n.max(1);
            }

            let id = service
                .add_host(&host)
                .with_context(|| format!("Failed to add host '{name}'"))?;
            if json {
                format::print_json(&json!({ "id": id, "name": name }));
            } else {
                println!("Host '{name}' added with id {id}");
            }
        }
        HostCommands::List => {
            let hosts = service.list_hosts()?;
            if json {
                format::print_json(&hosts);
            } else {
                format::print_hosts(&hosts);
            }
        }
        HostCommands::Freeze { id } => {
            service.set_host_frozen(id, true).await?;
            println!("Host {id} frozen");
        }
        HostCommands::Unfreeze { id } => {
            service.set_host_frozen(id, false).await?;
            println!("Host {id} unfrozen");
        }
        HostCommands::Resync { id } => {
            let usage = service.resync_host(id)?;
            if json {
                format::print_json(&json!({
                    "cpu": usage.cpu,
                    "memory_mb": usage.memory_mb,
                    "disk_mb": usage.disk_mb,
                    "containers": usage.containers,
                    "vms": usage.vms,
                }));
            } else {
                println!(
                    "Host {id}: cpu {} memory {}MB disk {}MB containers {} vms {}",
                    usage.cpu, usage.memory_mb, usage.disk_mb, usage.containers, usage.vms
                );
            }
        }
        HostCommands::Probe { id } => {
            let ctx = OpContext::background().with_timeout(Duration::from_secs(60));
            let status = service.registry().probe(&ctx, id).await?;
            println!("Host {id}: {status}");
        }
        HostCommands::Ports { id } => {
            let usage = service.port_usage(id)?;
            if json {
                format::print_json(&usage);
            } else {
                println!(
                    "Host {id}: range {}-{} ({} ports), {} active mappings, next {}",
                    usage.range_start,
                    usage.range_end,
                    usage.total_ports,
                    usage.active_mappings,
                    usage.next_available_port
                );
            }
        }
        HostCommands::Remove { id } => {
            service.remove_host(id).await?;
            println!("Host {id} removed");
        }
    }
    Ok(())
}
