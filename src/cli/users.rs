use super::format;
use crate::{ImageCommands, UserCommands};
use anyhow::{Context, Result};
use fleet_control::models::{Image, ImageStatus};
use fleet_control::ControlService;
use serde_json::json;

pub fn execute(service: &ControlService, cmd: UserCommands, json: bool) -> Result<()> {
    match cmd {
        UserCommands::Add {
            username,
            level,
            traffic_mb,
        } => {
            let id = service
                .add_user(&username, level, traffic_mb)
                .with_context(|| format!("Failed to add user '{username}'"))?;
            if json {
                format::print_json(&json!({ "id": id, "username": username }));
            } else {
                println!("User '{username}' added with id {id}");
            }
        }
        UserCommands::List => {
            let users = service.list_users()?;
            if json {
                format::print_json(&users);
            } else {
                format::print_users(&users);
            }
        }
        UserCommands::Recalc { id } => {
            let quota = service.recalculate_user_quota(id)?;
            println!("User {id}: used quota {quota}");
        }
    }
    Ok(())
}

pub fn execute_image(service: &ControlService, cmd: ImageCommands, json: bool) -> Result<()> {
    match cmd {
        ImageCommands::Add {
            name,
            url,
            providers,
            instance_type,
            os_type,
            os_version,
            arch,
        } => {
            let image = Image {
                id: 0,
                name: name.clone(),
                os_type,
                os_version,
                architecture: arch,
                provider_type: providers,
                instance_type,
                url,
                status: ImageStatus::Active,
                description: String::new(),
                created_at: 0,
            };
            let id = service
                .add_image(&image)
                .with_context(|| format!("Failed to add image '{name}'"))?;
            println!("Image '{name}' added with id {id}");
        }
        ImageCommands::List => {
            let images = service.list_images()?;
            if json {
                format::print_json(&images);
            } else {
                format::print_images(&images);
            }
        }
    }
    Ok(())
}
