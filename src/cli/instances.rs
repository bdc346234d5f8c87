use super::format;
use crate::{InstanceCommands, PortCommands};
use anyhow::{Context, Result};
use fleet_control::models::{Task, TaskStatus};
use fleet_control::{AddPortRequest, Caller, ControlService, CreateRequest};
use std::time::Duration;

/// Slack on top of a task's own deadline before the CLI stops waiting.
const WAIT_SLACK: Duration = Duration::from_secs(60);

/// The CLI runs tasks in-process, so it stays until each one ends.
async fn wait(service: &ControlService, task: Task, json: bool) -> Result<()> {
    println!("Task {} ({}) submitted, waiting...", task.id, task.task_type);
    let limit = Duration::from_secs(task.timeout_duration_s.max(1) as u64) + WAIT_SLACK;
    let done = service
        .tasks()
        .wait_terminal(task.id, limit)
        .await
        .with_context(|| format!("Task {} did not finish", task.id))?;
    if json {
        format::print_json(&done);
    } else {
        format::print_task(&done);
    }
    if done.status != TaskStatus::Completed {
        anyhow::bail!("Task {} ended as {}", done.id, done.status);
    }
    Ok(())
}

pub async fn execute(service: &ControlService, cmd: InstanceCommands, json: bool) -> Result<()> {
    match cmd {
        InstanceCommands::Create {
            user,
            host,
            image,
            cpu,
            memory,
            disk,
            bandwidth,
            description,
        } => {
            let task = service
                .create_instance(
                    user,
                    &CreateRequest {
                        provider_id: host,
                        image_id: image,
                        cpu_id: cpu,
                        memory_id: memory,
                        disk_id: disk,
                        bandwidth_id: bandwidth,
                        description,
                    },
                )
                .context("Create request rejected")?;
            wait(service, task, json).await
        }
        InstanceCommands::List { user } => {
            let instances = service.list_instances(user)?;
            if json {
                format::print_json(&instances);
            } else {
                format::print_instances(&instances);
            }
            Ok(())
        }
        InstanceCommands::Action { id, action } => {
            let task = service
                .instance_action(Caller::Admin, id, action)
                .with_context(|| format!("Failed to {action} instance {id}"))?;
            wait(service, task, json).await
        }
        InstanceCommands::ResetPassword { id } => {
            let task = service.reset_password(Caller::Admin, id)?;
            wait(service, task, json).await
        }
    }
}

pub async fn execute_port(service: &ControlService, cmd: PortCommands, json: bool) -> Result<()> {
    match cmd {
        PortCommands::Add {
            instance,
            guest_port,
            host_port,
            protocol,
            description,
        } => {
            let task = service
                .add_port_mapping(
                    Caller::Admin,
                    &AddPortRequest {
                        instance_id: instance,
                        host_port,
                        guest_port,
                        protocol,
                        description,
                    },
                )
                .await
                .context("Port mapping rejected")?;
            wait(service, task, json).await
        }
        PortCommands::Remove { id } => {
            let task = service.remove_port_mapping(Caller::Admin, id)?;
            wait(service, task, json).await
        }
        PortCommands::List { instance } => {
            let mappings = service.list_port_mappings(Caller::Admin, instance)?;
            if json {
                format::print_json(&mappings);
            } else {
                format::print_ports(&mappings);
            }
            Ok(())
        }
    }
}
