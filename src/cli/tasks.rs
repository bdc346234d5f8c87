use super::format;
use crate::TaskCommands;
use anyhow::Result;
use fleet_control::state::tasks::TaskFilter;
use fleet_control::{Caller, ControlService};
use serde_json::json;

pub fn execute(service: &ControlService, cmd: TaskCommands, json: bool) -> Result<()> {
    match cmd {
        TaskCommands::List {
            user,
            host,
            status,
            page,
            page_size,
        } => {
            let filter = TaskFilter {
                user_id: user,
                host_id: host,
                task_type: None,
                status,
                page,
                page_size,
            };
            let (views, total) = service.list_tasks(&filter)?;
            if json {
                format::print_json(&json!({ "total": total, "tasks": views }));
            } else {
                format::print_tasks(&views, total);
            }
        }
        TaskCommands::Show { id } => {
            let view = service.get_task(Caller::Admin, id)?;
            if json {
                format::print_json(&view);
            } else {
                format::print_task_view(&view);
            }
        }
        TaskCommands::Cancel { id, reason } => {
            let view = service.cancel_task(Caller::Admin, id, &reason)?;
            println!("Task {id}: {}", view.task.status);
        }
        TaskCommands::ForceCancel { id, reason } => {
            let view = service.force_cancel_task(id, &reason)?;
            println!("Task {id}: {}", view.task.status);
        }
        TaskCommands::Stats => {
            let stats = service.task_stats()?;
            if json {
                let map: serde_json::Map<String, serde_json::Value> = stats
                    .iter()
                    .map(|(status, count)| (status.to_string(), json!(count)))
                    .collect();
                format::print_json(&map);
            } else {
                for (status, count) in stats {
                    println!("{:<12} {count}", status.as_str());
                }
            }
        }
    }
    Ok(())
}

pub fn traffic_sync(service: &ControlService, json: bool) -> Result<()> {
    let report = service.sync_traffic()?;
    if json {
        format::print_json(&json!({
            "instances_synced": report.instances_synced,
            "stop_tasks": report.stop_tasks,
            "start_tasks": report.start_tasks,
            "resets": report.resets,
        }));
    } else {
        println!(
            "Synced {} instances, {} stop and {} start tasks queued, {} resets",
            report.instances_synced, report.stop_tasks, report.start_tasks, report.resets
        );
    }
    Ok(())
}
