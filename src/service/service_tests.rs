#[cfg(test)]
mod tests {
    use super::super::{AddPortRequest, Caller, ControlService, CreateRequest, InstanceAction};
    use crate::config::ControlConfig;
    use crate::images::ImageManager;
    use crate::models::{
        ExecutionRule, Host, HostType, Image, ImageStatus, InstanceStatus, InstanceType,
        MappingMethod, NetworkType, PortStatus, Protocol, TaskStatus, TaskType,
    };
    use crate::registry::{ProviderRegistry, StaticShellFactory};
    use crate::ssh::{Reply, ScriptedShell};
    use crate::state::fixtures::{instance, temp_db};
    use crate::state::tasks::{NewTask, TaskFilter};
    use crate::state::{hosts, images, instances, ports, reservations, tasks, users};
    use crate::tasks::TaskManager;
    use crate::ControlError;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const RUNNING_JSON: &str = r#"[{"name": "lxd-a-00ff", "status": "Running", "type": "container",
        "state": {"status": "Running", "network": {"eth0": {"addresses": [
            {"family": "inet", "address": "10.0.3.15", "scope": "global"}]}}}}]"#;
    const WAIT: Duration = Duration::from_secs(20);

    struct Harness {
        service: ControlService,
        host_id: i64,
        alice: i64,
        bob: i64,
        image_id: i64,
        _dir: TempDir,
    }

    fn setup() -> Harness {
        let (db, dir) = temp_db();
        let mut host = Host::new("lxd-a", HostType::Lxd, "127.0.0.1:1");
        host.execution_rule = ExecutionRule::SshOnly;
        host.ipv4_port_mapping_method = MappingMethod::Native;
        host.node_cpu_cores = 4;
        host.node_memory_mb = 8192;
        host.node_disk_mb = 102400;
        host.default_port_count = 3;

        let (host_id, alice, bob, image_id) = db
            .write(|tx| {
                let host_id = hosts::insert(tx, &host)?;
                let alice = users::insert(tx, "alice", 1, 0, 0)?;
                let bob = users::insert(tx, "bob", 1, 0, 0)?;
                let image_id = images::insert(
                    tx,
                    &Image {
                        id: 0,
                        name: "ubuntu-22.04".into(),
                        os_type: "ubuntu".into(),
                        os_version: "22.04".into(),
                        architecture: "amd64".into(),
                        provider_type: "lxd,incus".into(),
                        instance_type: InstanceType::Container,
                        url: "https://example/ubuntu.tar.xz".into(),
                        status: ImageStatus::Active,
                        description: String::new(),
                        created_at: 0,
                    },
                )?;
                Ok((host_id, alice, bob, image_id))
            })
            .unwrap();

        let shell = Arc::new(ScriptedShell::new());
        shell.on("image info", Reply::Fail("Error: not found".into()));
        shell.on("test -s", Reply::Fail(String::new()));
        shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

        let mut config = ControlConfig::default();
        config.tasks.post_create_boot_wait_secs = 0;
        config.tasks.failed_instance_cleanup_delay_secs = 0;
        config.tasks.password_retry_sleep_secs = 0;
        config.tasks.ready_timeout_secs = 1;
        config.tasks.shutdown_grace_secs = 1;
        let config = Arc::new(config);

        let registry = Arc::new(ProviderRegistry::new(
            db.clone(),
            config.clone(),
            Arc::new(ImageManager::new(config.cdn.clone())),
            Arc::new(StaticShellFactory(shell)),
        ));
        let manager = TaskManager::with_name_suffix(
            db.clone(),
            config.clone(),
            registry.clone(),
            || "00ff".to_string(),
        );
        Harness {
            service: ControlService::from_parts(db, config, registry, manager),
            host_id,
            alice,
            bob,
            image_id,
            _dir: dir,
        }
    }

    impl Harness {
        fn request(&self) -> CreateRequest {
            CreateRequest {
                provider_id: self.host_id,
                image_id: self.image_id,
                cpu_id: "cpu-1".into(),
                memory_id: "mem-512".into(),
                disk_id: "disk-5000".into(),
                bandwidth_id: "bw-100".into(),
                description: "web".into(),
            }
        }

        fn task_count(&self) -> i64 {
            self.service
                .list_tasks(&TaskFilter::default())
                .unwrap()
                .1
        }

        fn seed_instance(&self, user_id: i64) -> i64 {
            self.service
                .db()
                .write(|tx| instances::insert(tx, &instance(self.host_id, user_id, "lxd-a-00ff")))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_runs_to_completion() {
        let h = setup();
        let task = h.service.create_instance(h.alice, &h.request()).unwrap();
        assert_eq!(task.task_type, TaskType::Create);
        assert_eq!(task.host_id, Some(h.host_id));

        let done = h.service.tasks().wait_terminal(task.id, WAIT).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);
        let created = h.service.list_instances(h.alice).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, InstanceStatus::Running);

        // Default mappings live as long as the instance.
        let mappings = h
            .service
            .list_port_mappings(Caller::User(h.alice), created[0].id)
            .unwrap();
        assert_eq!(mappings.len(), 3);
        let err = h
            .service
            .remove_port_mapping(Caller::User(h.alice), mappings[0].id)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn test_rejected_create_writes_nothing() {
        let h = setup();
        h.service.create_instance(h.alice, &h.request()).unwrap();

        // Level 1 allows a single instance.
        let err = h.service.create_instance(h.alice, &h.request()).unwrap_err();
        assert!(matches!(err, ControlError::QuotaExceeded(_)), "{err}");
        assert_eq!(h.task_count(), 1);

        let mut bad = h.request();
        bad.cpu_id = "cpu-64".into();
        let err = h.service.create_instance(h.bob, &bad).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)), "{err}");
        assert_eq!(h.task_count(), 1);
        let held = h
            .service
            .db()
            .read(|c| reservations::list_active_by_user(c, h.bob, crate::models::now_ts()))
            .unwrap();
        assert!(held.is_empty());
    }

    #[tokio::test]
    async fn test_frozen_host_rejects_create() {
        let h = setup();
        h.service.set_host_frozen(h.host_id, true).await.unwrap();
        let err = h.service.create_instance(h.alice, &h.request()).unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)), "{err}");
        assert_eq!(h.task_count(), 0);

        h.service.set_host_frozen(h.host_id, false).await.unwrap();
        assert!(h.service.create_instance(h.alice, &h.request()).is_ok());
    }

    #[tokio::test]
    async fn test_image_for_other_architecture_is_rejected() {
        let h = setup();
        h.service
            .db()
            .write(|tx| {
                tx.execute(
                    "UPDATE system_images SET architecture = 'arm64' WHERE id = ?1",
                    [h.image_id],
                )?;
                Ok(())
            })
            .unwrap();

        let err = h.service.create_instance(h.alice, &h.request()).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)), "{err}");
        assert!(err.to_string().contains("arm64"), "{err}");
        assert_eq!(h.task_count(), 0);
    }

    #[tokio::test]
    async fn test_actions_check_owner_and_open_tasks() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);

        let err = h
            .service
            .instance_action(Caller::User(h.bob), instance_id, InstanceAction::Stop)
            .unwrap_err();
        assert!(matches!(err, ControlError::PermissionDenied(_)));

        // A queued task that no worker has picked up yet still blocks new actions.
        let mut open = NewTask::new(h.alice, TaskType::Restart, "{}".to_string());
        open.host_id = Some(h.host_id);
        open.instance_id = Some(instance_id);
        h.service.db().write(|tx| tasks::insert(tx, &open)).unwrap();
        let err = h
            .service
            .instance_action(Caller::User(h.alice), instance_id, InstanceAction::Stop)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)), "{err}");
        assert_eq!(h.task_count(), 1);
    }

    #[tokio::test]
    async fn test_action_refused_from_wrong_status() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);
        h.service
            .db()
            .write(|tx| instances::set_status(tx, instance_id, InstanceStatus::Stopped))
            .unwrap();
        let err = h
            .service
            .instance_action(Caller::User(h.alice), instance_id, InstanceAction::Stop)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
        assert_eq!(h.task_count(), 0);
    }

    #[tokio::test]
    async fn test_traffic_limited_start_needs_admin() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);
        h.service
            .db()
            .write(|tx| {
                instances::set_status(tx, instance_id, InstanceStatus::Stopped)?;
                instances::set_traffic_limited(tx, instance_id, true)
            })
            .unwrap();
        let err = h
            .service
            .instance_action(Caller::User(h.alice), instance_id, InstanceAction::Start)
            .unwrap_err();
        assert!(matches!(err, ControlError::QuotaExceeded(_)));

        let task = h
            .service
            .instance_action(Caller::Admin, instance_id, InstanceAction::Start)
            .unwrap();
        assert_eq!(task.task_type, TaskType::Start);
    }

    #[tokio::test]
    async fn test_port_mapping_round_trip() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);
        let task = h
            .service
            .add_port_mapping(
                Caller::User(h.alice),
                &AddPortRequest {
                    instance_id,
                    host_port: None,
                    guest_port: 8080,
                    protocol: Protocol::Tcp,
                    description: "http".into(),
                },
            )
            .await
            .unwrap();
        let done = h.service.tasks().wait_terminal(task.id, WAIT).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);

        let mapping = h
            .service
            .list_port_mappings(Caller::User(h.alice), instance_id)
            .unwrap()
            .into_iter()
            .find(|m| m.guest_port == 8080)
            .unwrap();
        assert_eq!(mapping.status, PortStatus::Active);
        assert_eq!(mapping.host_port, 10000);

        let err = h
            .service
            .remove_port_mapping(Caller::User(h.bob), mapping.id)
            .unwrap_err();
        assert!(matches!(err, ControlError::PermissionDenied(_)));

        let task = h
            .service
            .remove_port_mapping(Caller::User(h.alice), mapping.id)
            .unwrap();
        let done = h.service.tasks().wait_terminal(task.id, WAIT).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(h
            .service
            .db()
            .read(|c| ports::find(c, mapping.id))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_port_mapping_refused_on_ipv6_only_host() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);
        h.service
            .db()
            .write(|tx| {
                tx.execute(
                    "UPDATE hosts SET network_type = ?1 WHERE id = ?2",
                    rusqlite::params![NetworkType::Ipv6Only, h.host_id],
                )?;
                Ok(())
            })
            .unwrap();
        let err = h
            .service
            .add_port_mapping(
                Caller::User(h.alice),
                &AddPortRequest {
                    instance_id,
                    host_port: Some(10080),
                    guest_port: 80,
                    protocol: Protocol::Tcp,
                    description: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
        assert_eq!(h.task_count(), 0);
    }

    #[tokio::test]
    async fn test_task_view_and_cancel() {
        let h = setup();
        let instance_id = h.seed_instance(h.alice);
        let data = format!(r#"{{"instance_id":{instance_id}}}"#);
        let mut new = NewTask::new(h.alice, TaskType::Stop, data);
        new.host_id = Some(h.host_id);
        new.instance_id = Some(instance_id);
        let task = h
            .service
            .db()
            .write(|tx| tasks::insert(tx, &new))
            .unwrap();

        let view = h.service.get_task(Caller::User(h.alice), task.id).unwrap();
        assert!(view.can_cancel);
        assert!(!view.can_force_stop);
        assert_eq!(view.remaining_secs, None);
        assert!(matches!(
            h.service.get_task(Caller::User(h.bob), task.id),
            Err(ControlError::PermissionDenied(_))
        ));

        let view = h
            .service
            .cancel_task(Caller::User(h.alice), task.id, "changed my mind")
            .unwrap();
        assert_eq!(view.task.status, TaskStatus::Cancelled);
        assert!(!view.can_cancel);

        let stats = h.service.task_stats().unwrap();
        assert!(stats.contains(&(TaskStatus::Cancelled, 1)));
    }

    #[tokio::test]
    async fn test_remove_host_with_instances_is_refused() {
        let h = setup();
        h.seed_instance(h.alice);
        assert!(h.service.remove_host(h.host_id).await.is_err());
        assert_eq!(h.service.list_hosts().unwrap().len(), 1);
    }
}
