#[cfg(test)]
mod tests {
    use super::super::StateDatabase;
    use crate::models::{
        Host, HostType, Instance, InstanceStatus, InstanceType, MappingMethod, Protocol,
        TaskStatus, TaskType,
    };
    use crate::state::ports::NewPortMapping;
    use crate::state::tasks::{NewTask, TaskFilter};
    use crate::state::{hosts, instances, ports, tasks, users};
    use crate::ControlError;
    use tempfile::TempDir;

    fn create_test_db() -> (StateDatabase, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = StateDatabase::new(&db_path).unwrap();
        (db, temp_dir)
    }

    fn seed_instance(db: &StateDatabase) -> (i64, i64, i64) {
        db.write(|tx| {
            let host_id = hosts::insert(tx, &Host::new("lxd-a", HostType::Lxd, "10.0.0.1"))?;
            let user_id = users::insert(tx, "alice", 2, 0, 0)?;
            let instance = Instance {
                id: 0,
                name: "lxd-a-1a2b".into(),
                host_id,
                user_id,
                image_name: "ubuntu-22.04".into(),
                image_url: String::new(),
                instance_type: InstanceType::Container,
                cpu_cores: 1,
                memory_mb: 512,
                disk_mb: 5000,
                bandwidth_mbps: 300,
                status: InstanceStatus::Creating,
                os_type: "ubuntu".into(),
                username: "root".into(),
                password: "pw".into(),
                public_ip: None,
                private_ip: None,
                ipv6_address: None,
                public_ipv6: None,
                ssh_port: 22,
                vnstat_interface: None,
                traffic_limited: false,
                expires_at: None,
                created_at: 0,
                updated_at: 0,
                deleted_at: None,
            };
            let instance_id = instances::insert(tx, &instance)?;
            Ok((host_id, user_id, instance_id))
        })
        .unwrap()
    }

    #[test]
    fn test_create_database() {
        let (_db, _temp) = create_test_db();
    }

    #[test]
    fn test_save_and_get_host() {
        let (db, _temp) = create_test_db();
        let mut host = Host::new("pve-1", HostType::Proxmox, "192.0.2.10:8006");
        host.port_range_start = 20000;
        host.port_range_end = 20100;
        let id = db.write(|tx| hosts::insert(tx, &host)).unwrap();

        let stored = db.read(|conn| hosts::get(conn, id)).unwrap();
        assert_eq!(stored.name, "pve-1");
        assert_eq!(stored.host_type, HostType::Proxmox);
        assert_eq!(stored.next_available_port, 20000);
        assert_eq!(stored.used_memory_mb, 0);
    }

    #[test]
    fn test_get_nonexistent_host() {
        let (db, _temp) = create_test_db();
        let result = db.read(|conn| hosts::get(conn, 42));
        assert!(matches!(result, Err(ControlError::HostNotFound(_))));
    }

    #[test]
    fn test_duplicate_host_name() {
        let (db, _temp) = create_test_db();
        let host = Host::new("dup", HostType::Docker, "10.0.0.9");
        db.write(|tx| hosts::insert(tx, &host)).unwrap();
        assert!(db.write(|tx| hosts::insert(tx, &host)).is_err());
    }

    #[test]
    fn test_counter_delta_clamps_at_zero() {
        let (db, _temp) = create_test_db();
        let id = db
            .write(|tx| hosts::insert(tx, &Host::new("h", HostType::Lxd, "10.0.0.2")))
            .unwrap();
        let delta = hosts::HostDelta::allocation(InstanceType::Vm, 2, 1024, 2048);
        db.write(|tx| hosts::apply_delta(tx, id, delta)).unwrap();
        db.write(|tx| hosts::apply_delta(tx, id, delta.negate())).unwrap();
        db.write(|tx| hosts::apply_delta(tx, id, delta.negate())).unwrap();

        let host = db.read(|conn| hosts::get(conn, id)).unwrap();
        assert_eq!(host.used_cpu_cores, 0);
        assert_eq!(host.used_memory_mb, 0);
        assert_eq!(host.vm_count, 0);
    }

    #[test]
    fn test_active_port_unique_per_host() {
        let (db, _temp) = create_test_db();
        let (host_id, _user_id, instance_id) = seed_instance(&db);
        let mapping = NewPortMapping {
            instance_id,
            host_id,
            host_port: 20000,
            guest_port: 22,
            protocol: Protocol::Tcp,
            description: "SSH".into(),
            is_ssh: true,
            is_automatic: true,
            ipv6_enabled: false,
            mapping_method: MappingMethod::Iptables,
        };
        let first = db.write(|tx| ports::insert(tx, &mapping)).unwrap();
        assert!(db.write(|tx| ports::insert(tx, &mapping)).is_err());

        // A failed row no longer holds the port.
        db.write(|tx| ports::set_status(tx, first, crate::models::PortStatus::Failed))
            .unwrap();
        db.write(|tx| ports::insert(tx, &mapping)).unwrap();
    }

    #[test]
    fn test_soft_delete_hides_instance() {
        let (db, _temp) = create_test_db();
        let (_host_id, user_id, instance_id) = seed_instance(&db);
        db.write(|tx| instances::soft_delete(tx, instance_id)).unwrap();

        assert!(db.read(|conn| instances::get(conn, instance_id)).is_err());
        let row = db
            .read(|conn| instances::get_unscoped(conn, instance_id))
            .unwrap();
        assert_eq!(row.status, InstanceStatus::Deleted);
        assert!(row.deleted_at.is_some());
        let ids = db
            .read(|conn| instances::ids_by_user_unscoped(conn, user_id))
            .unwrap();
        assert_eq!(ids, vec![instance_id]);
    }

    #[test]
    fn test_task_completed_at_tracks_terminal_status() {
        let (db, _temp) = create_test_db();
        let task = db
            .write(|tx| tasks::insert(tx, &NewTask::new(1, TaskType::Start, "{}".into())))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());

        assert!(db.write(|tx| tasks::mark_running(tx, task.id)).unwrap());
        db.write(|tx| tasks::update_progress(tx, task.id, 50, "halfway"))
            .unwrap();
        let running = db.read(|conn| tasks::get(conn, task.id)).unwrap();
        assert_eq!(running.progress, 50);
        assert!(running.completed_at.is_none());

        assert!(db
            .write(|tx| tasks::finish(tx, task.id, TaskStatus::Completed, "done", None))
            .unwrap());
        let done = db.read(|conn| tasks::get(conn, task.id)).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        // Terminal rows are never rewritten.
        assert!(!db
            .write(|tx| tasks::finish(tx, task.id, TaskStatus::Failed, "x", Some("x")))
            .unwrap());
        db.write(|tx| tasks::update_progress(tx, task.id, 10, "late"))
            .unwrap();
        let still = db.read(|conn| tasks::get(conn, task.id)).unwrap();
        assert_eq!(still.status, TaskStatus::Completed);
        assert_eq!(still.status_message, "done");
    }

    #[test]
    fn test_task_list_filters_and_pages() {
        let (db, _temp) = create_test_db();
        for i in 0..5 {
            let mut t = NewTask::new(7, TaskType::Stop, "{}".into());
            t.host_id = Some(if i % 2 == 0 { 1 } else { 2 });
            db.write(|tx| tasks::insert(tx, &t)).unwrap();
        }
        db.write(|tx| tasks::insert(tx, &NewTask::new(8, TaskType::Create, "{}".into())))
            .unwrap();

        let filter = TaskFilter {
            user_id: Some(7),
            host_id: Some(1),
            page: 1,
            page_size: 2,
            ..Default::default()
        };
        let (rows, total) = db.read(|conn| tasks::list(conn, &filter)).unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id > rows[1].id);

        let filter = TaskFilter {
            task_type: Some(TaskType::Create),
            ..Default::default()
        };
        let (rows, total) = db.read(|conn| tasks::list(conn, &filter)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].user_id, 8);
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let (db, _temp) = create_test_db();
        let res: crate::Result<()> = db.write(|tx| {
            hosts::insert(tx, &Host::new("rollback", HostType::Lxd, "10.0.0.3"))?;
            Err(ControlError::Internal("abort".into()))
        });
        assert!(res.is_err());
        assert!(db
            .read(|conn| hosts::find_by_name(conn, "rollback"))
            .unwrap()
            .is_none());
    }
}
