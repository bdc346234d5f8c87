#[cfg(test)]
mod tests {
    use super::super::{fold_reading, month_of, next_reset_at, sync_instance_at, TrafficAggregator};
    use crate::config::ControlConfig;
    use crate::images::ImageManager;
    use crate::models::{
        now_ts, ExecutionRule, Host, HostType, InstanceStatus, TaskStatus, TaskType,
        TrafficRecord, VnstatSample,
    };
    use crate::registry::{ProviderRegistry, StaticShellFactory};
    use crate::ssh::{Reply, ScriptedShell};
    use crate::state::fixtures::{instance, temp_db};
    use crate::state::{hosts, instances, tasks, traffic, users, StateDatabase};
    use crate::tasks::TaskManager;
    use std::sync::Arc;
    use std::time::Duration;

    const MB: i64 = 1024 * 1024;
    const RUNNING_JSON: &str = r#"[{"name": "lxd-a-00ff", "status": "Running", "type": "container",
        "state": {"status": "Running", "network": {}}}]"#;

    fn empty_record() -> TrafficRecord {
        TrafficRecord {
            id: 0,
            user_id: 1,
            host_id: 1,
            instance_id: 1,
            year: 2024,
            month: 12,
            traffic_in_mb: 0,
            traffic_out_mb: 0,
            total_used_mb: 0,
            interface_name: String::new(),
            vnstat_version: 0,
            last_vnstat_rx_mb: 0,
            last_vnstat_tx_mb: 0,
            last_sync_at: None,
        }
    }

    fn rollup(instance_id: i64, now: i64, rx_mb: i64, tx_mb: i64) -> VnstatSample {
        let (year, month) = month_of(now);
        VnstatSample {
            instance_id,
            interface: "eth0".into(),
            year,
            month,
            day: 0,
            hour: 0,
            rx_bytes: rx_mb * MB,
            tx_bytes: tx_mb * MB,
        }
    }

    fn seed(db: &StateDatabase, total_traffic_mb: i64) -> (i64, i64, i64) {
        db.write(|tx| {
            let mut host = Host::new("lxd-a", HostType::Lxd, "127.0.0.1:1");
            host.execution_rule = ExecutionRule::SshOnly;
            let host_id = hosts::insert(tx, &host)?;
            let user_id = users::insert(tx, "alice", 1, 0, total_traffic_mb)?;
            let instance_id = instances::insert(tx, &instance(host_id, user_id, "lxd-a-00ff"))?;
            Ok((host_id, user_id, instance_id))
        })
        .unwrap()
    }

    #[test]
    fn test_month_boundaries() {
        assert_eq!(month_of(1734256800), (2024, 12));
        assert_eq!(next_reset_at(1734256800), 1735689600);
        assert_eq!(month_of(1735689600), (2025, 1));
        assert_eq!(next_reset_at(1707553800), 1709251200);
    }

    #[test]
    fn test_fold_detects_counter_reset() {
        let mut record = empty_record();
        fold_reading(&mut record, 100, 50);
        assert_eq!((record.traffic_in_mb, record.traffic_out_mb), (100, 50));
        assert_eq!(record.total_used_mb, 150);

        fold_reading(&mut record, 150, 80);
        assert_eq!(record.total_used_mb, 230);
        assert_eq!(record.vnstat_version, 0);

        // Counters restarted on the instance: the new reading is all fresh traffic.
        fold_reading(&mut record, 20, 10);
        assert_eq!(record.vnstat_version, 1);
        assert_eq!((record.traffic_in_mb, record.traffic_out_mb), (170, 90));
        assert_eq!(record.total_used_mb, 260);
        assert_eq!((record.last_vnstat_rx_mb, record.last_vnstat_tx_mb), (20, 10));
    }

    #[test]
    fn test_sync_instance_folds_latest_rollup() {
        let (db, _dir) = temp_db();
        let (host_id, user_id, instance_id) = seed(&db, 0);
        let now = now_ts();

        assert!(sync_instance_at(&db, instance_id, now).unwrap().is_none());

        db.write(|tx| {
            traffic::insert_sample(tx, &rollup(instance_id, now, 300, 100))?;
            let mut daily = rollup(instance_id, now, 9000, 9000);
            daily.day = 3;
            traffic::insert_sample(tx, &daily)
        })
        .unwrap();
        let record = sync_instance_at(&db, instance_id, now).unwrap().unwrap();
        assert_eq!(record.total_used_mb, 400);
        assert_eq!(record.interface_name, "eth0");

        db.write(|tx| traffic::insert_sample(tx, &rollup(instance_id, now, 500, 100)))
            .unwrap();
        sync_instance_at(&db, instance_id, now).unwrap();

        let (year, month) = month_of(now);
        let stored = db
            .read(|c| traffic::find(c, instance_id, year, month))
            .unwrap()
            .unwrap();
        assert_eq!(stored.traffic_in_mb, 500);
        assert_eq!(stored.total_used_mb, 600);
        assert_eq!(
            db.read(|c| traffic::user_month_total(c, user_id, year, month))
                .unwrap(),
            600
        );
        assert_eq!(
            db.read(|c| traffic::host_month_total(c, host_id, year, month))
                .unwrap(),
            600
        );
    }

    #[test]
    fn test_deleted_instances_still_count() {
        let (db, _dir) = temp_db();
        let (_, user_id, instance_id) = seed(&db, 0);
        let now = now_ts();
        db.write(|tx| traffic::insert_sample(tx, &rollup(instance_id, now, 70, 30)))
            .unwrap();
        sync_instance_at(&db, instance_id, now).unwrap();
        db.write(|tx| instances::soft_delete(tx, instance_id)).unwrap();

        let (year, month) = month_of(now);
        assert_eq!(
            db.read(|c| traffic::user_month_total(c, user_id, year, month))
                .unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn test_limit_stops_instances_and_reset_resumes_them() {
        let (db, _dir) = temp_db();
        let (_, user_id, instance_id) = seed(&db, 100);
        let shell = Arc::new(ScriptedShell::new());
        shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

        let config = Arc::new(ControlConfig::default());
        let registry = Arc::new(ProviderRegistry::new(
            db.clone(),
            config.clone(),
            Arc::new(ImageManager::new(config.cdn.clone())),
            Arc::new(StaticShellFactory(shell.clone())),
        ));
        let manager = TaskManager::new(db.clone(), config.clone(), registry);
        let aggregator = TrafficAggregator::new(db.clone(), config, manager.clone());

        let now = now_ts();
        db.write(|tx| traffic::insert_sample(tx, &rollup(instance_id, now, 150, 50)))
            .unwrap();

        let report = aggregator.sync_all_at(now).unwrap();
        assert_eq!(report.instances_synced, 1);
        assert_eq!(report.stop_tasks, 1);
        let user = db.read(|c| users::get(c, user_id)).unwrap();
        assert!(user.traffic_limited);
        assert_eq!(user.used_traffic_mb, 200);
        assert_eq!(user.traffic_reset_at, Some(next_reset_at(now)));

        // No duplicate stop while one is queued or after it finished.
        assert_eq!(aggregator.sync_all_at(now).unwrap().stop_tasks, 0);

        let stop = db
            .read(|c| {
                tasks::list_by_status(
                    c,
                    &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed],
                )
            })
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::Stop)
            .unwrap();
        let stop = manager
            .wait_terminal(stop.id, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(stop.status, TaskStatus::Completed);
        let stopped = db.read(|c| instances::get(c, instance_id)).unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(stopped.traffic_limited);

        // Past the reset date the new month starts empty and the instance comes back.
        let later = next_reset_at(now) + 60;
        let report = aggregator.sync_all_at(later).unwrap();
        assert!(report.resets >= 1);
        assert_eq!(report.start_tasks, 1);
        let user = db.read(|c| users::get(c, user_id)).unwrap();
        assert!(!user.traffic_limited);
        assert_eq!(user.used_traffic_mb, 0);
        assert_eq!(user.traffic_reset_at, Some(next_reset_at(later)));
    }
}
