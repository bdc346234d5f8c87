use byte_unit::{Byte, UnitType};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use fleet_control::models::{Host, Image, Instance, PortMapping, Task, User};
use fleet_control::TaskView;
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("Failed to render JSON: {err}"),
    }
}

/// Format a size in megabytes into a human-readable string
fn format_mb(mb: i64) -> String {
    let byte = Byte::from_u64(mb.max(0) as u64 * 1024 * 1024);
    byte.get_appropriate_unit(UnitType::Binary).to_string()
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

pub fn print_hosts(hosts: &[Host]) {
    if hosts.is_empty() {
        println!("No hosts found.");
        return;
    }
    let mut t = table(vec![
        "ID", "NAME", "TYPE", "ENDPOINT", "STATUS", "FROZEN", "CPU", "MEMORY", "DISK", "INSTANCES",
    ]);
    for h in hosts {
        t.add_row(vec![
            h.id.to_string(),
            h.name.clone(),
            h.host_type.to_string(),
            h.endpoint.clone(),
            h.status.to_string(),
            h.is_frozen.to_string(),
            format!("{}/{}", h.used_cpu_cores, h.node_cpu_cores),
            format!("{}/{}", format_mb(h.used_memory_mb), format_mb(h.node_memory_mb)),
            format!("{}/{}", format_mb(h.used_disk_mb), format_mb(h.node_disk_mb)),
            format!("{}c {}vm", h.container_count, h.vm_count),
        ]);
    }
    println!("{t}");
}

pub fn print_users(users: &[User]) {
    let mut t = table(vec![
        "ID",
        "USERNAME",
        "LEVEL",
        "STATUS",
        "QUOTA",
        "TRAFFIC (MB)",
        "LIMITED",
    ]);
    for u in users {
        t.add_row(vec![
            u.id.to_string(),
            u.username.clone(),
            u.level.to_string(),
            u.status.to_string(),
            u.used_quota.to_string(),
            format!("{}/{}", u.used_traffic_mb, u.total_traffic_mb),
            u.traffic_limited.to_string(),
        ]);
    }
    println!("{t}");
}

pub fn print_images(images: &[Image]) {
    let mut t = table(vec!["ID", "NAME", "TYPE", "PROVIDERS", "ARCH", "STATUS"]);
    for i in images {
        t.add_row(vec![
            i.id.to_string(),
            i.name.clone(),
            i.instance_type.to_string(),
            i.provider_type.clone(),
            i.architecture.clone(),
            i.status.to_string(),
        ]);
    }
    println!("{t}");
}

pub fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!("No instances found.");
        return;
    }
    let mut t = table(vec![
        "ID", "NAME", "STATUS", "TYPE", "CPU", "MEMORY", "DISK", "ADDRESS", "SSH PORT",
    ]);
    for i in instances {
        t.add_row(vec![
            i.id.to_string(),
            i.name.clone(),
            i.status.to_string(),
            i.instance_type.to_string(),
            i.cpu_cores.to_string(),
            format_mb(i.memory_mb),
            format_mb(i.disk_mb),
            i.public_ip.clone().unwrap_or_default(),
            i.ssh_port.to_string(),
        ]);
    }
    println!("{t}");
}

pub fn print_ports(mappings: &[PortMapping]) {
    let mut t = table(vec![
        "ID",
        "HOST PORT",
        "GUEST PORT",
        "PROTOCOL",
        "STATUS",
        "AUTO",
        "DESCRIPTION",
    ]);
    for m in mappings {
        t.add_row(vec![
            m.id.to_string(),
            m.host_port.to_string(),
            m.guest_port.to_string(),
            m.protocol.to_string(),
            m.status.to_string(),
            m.is_automatic.to_string(),
            m.description.clone(),
        ]);
    }
    println!("{t}");
}

pub fn print_tasks(views: &[TaskView], total: i64) {
    let mut t = table(vec!["ID", "TYPE", "STATUS", "PROGRESS", "USER", "HOST", "MESSAGE"]);
    for v in views {
        t.add_row(vec![
            v.task.id.to_string(),
            v.task.task_type.to_string(),
            v.task.status.to_string(),
            format!("{}%", v.task.progress),
            v.task.user_id.to_string(),
            v.task.host_id.map(|h| h.to_string()).unwrap_or_default(),
            v.task.status_message.clone(),
        ]);
    }
    println!("{t}");
    println!("{} of {} tasks", views.len(), total);
}

pub fn print_task(task: &Task) {
    println!("Task: {} ({})", task.id, task.uuid);
    println!("  Type:       {}", task.task_type);
    println!("  Status:     {}", task.status);
    println!("  Progress:   {}%", task.progress);
    println!("  Message:    {}", task.status_message);
    if let Some(instance_id) = task.instance_id {
        println!("  Instance:   {instance_id}");
    }
    if let Some(error) = &task.error_message {
        println!("  Error:      {error}");
    }
    if let Some(reason) = &task.cancel_reason {
        println!("  Cancelled:  {reason}");
    }
}

pub fn print_task_view(view: &TaskView) {
    print_task(&view.task);
    println!("  Cancelable: {}", view.can_cancel);
    println!("  Force stop: {}", view.can_force_stop);
    if let Some(secs) = view.remaining_secs {
        println!("  Remaining:  {secs}s");
    }
}
