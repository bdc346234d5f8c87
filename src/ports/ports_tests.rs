#[cfg(test)]
mod tests {
    use super::super::{PortEngine, PortRequest};
    use crate::models::{Host, HostType, NetworkType, PortStatus, Protocol};
    use crate::state::fixtures::{instance, temp_db};
    use crate::state::{hosts, instances, users, StateDatabase};
    use crate::ControlError;
    use std::collections::HashSet;

    fn seed(db: &StateDatabase, host: Host) -> (i64, i64, i64) {
        db.write(|tx| {
            let host_id = hosts::insert(tx, &host)?;
            let user_id = users::insert(tx, "alice", 2, 0, 0)?;
            let a = instances::insert(tx, &instance(host_id, user_id, "h-aaaa"))?;
            let b = instances::insert(tx, &instance(host_id, user_id, "h-bbbb"))?;
            Ok((host_id, a, b))
        })
        .unwrap()
    }

    fn nat_host(start: u16, end: u16, count: i64) -> Host {
        let mut host = Host::new("lxd-a", HostType::Lxd, "10.0.0.1");
        host.port_range_start = start;
        host.port_range_end = end;
        host.default_port_count = count;
        host
    }

    #[test]
    fn test_default_mappings_skip_collision() {
        let (db, _temp) = temp_db();
        let (host_id, a, b) = seed(&db, nat_host(20000, 20100, 3));
        let engine = PortEngine::new(db.clone());

        engine
            .add(
                &PortRequest {
                    instance_id: a,
                    host_id,
                    host_port: Some(20000),
                    guest_port: 80,
                    protocol: Protocol::Tcp,
                    description: "web".into(),
                },
                &HashSet::new(),
            )
            .unwrap();

        let created = engine.allocate_default(b, host_id, &HashSet::new()).unwrap();
        let host_ports: Vec<u16> = created.iter().map(|m| m.host_port).collect();
        assert_eq!(host_ports, vec![20001, 20002, 20003]);
        assert!(created[0].is_ssh);
        assert_eq!(created[0].guest_port, 22);
        assert_eq!(created[0].protocol, Protocol::Both);
        assert_eq!(created[1].guest_port, 20002);
        assert_eq!(created[1].description, "端口20002");

        let stored = db.read(|c| instances::get(c, b)).unwrap();
        assert_eq!(stored.ssh_port, 20001);
        let host = db.read(|c| hosts::get(c, host_id)).unwrap();
        assert_eq!(host.next_available_port, 20004);
    }

    #[test]
    fn test_default_mappings_skip_ports_bound_on_host() {
        let (db, _temp) = temp_db();
        let (host_id, a, _) = seed(&db, nat_host(20000, 20100, 2));
        let engine = PortEngine::new(db);
        let bound: HashSet<u16> = [20000, 20001].into_iter().collect();
        let created = engine.allocate_default(a, host_id, &bound).unwrap();
        let host_ports: Vec<u16> = created.iter().map(|m| m.host_port).collect();
        assert_eq!(host_ports, vec![20002, 20003]);
    }

    #[test]
    fn test_default_count_zero_means_ten() {
        let (db, _temp) = temp_db();
        let (host_id, a, _) = seed(&db, nat_host(20000, 20100, 0));
        let engine = PortEngine::new(db);
        assert_eq!(engine.allocate_default(a, host_id, &HashSet::new()).unwrap().len(), 10);
    }

    #[test]
    fn test_default_mappings_truncated_by_small_range() {
        let (db, _temp) = temp_db();
        let (host_id, a, b) = seed(&db, nat_host(20000, 20002, 10));
        let engine = PortEngine::new(db);
        assert_eq!(engine.allocate_default(a, host_id, &HashSet::new()).unwrap().len(), 3);
        let err = engine.allocate_default(b, host_id, &HashSet::new()).unwrap_err();
        assert!(matches!(err, ControlError::NoPortsAvailable { .. }));
    }

    #[test]
    fn test_dedicated_and_ipv6_only_hosts_skip_defaults() {
        for network_type in [NetworkType::DedicatedIpv4, NetworkType::Ipv6Only] {
            let (db, _temp) = temp_db();
            let mut host = nat_host(20000, 20100, 3);
            host.network_type = network_type;
            let (host_id, a, _) = seed(&db, host);
            let engine = PortEngine::new(db);
            assert!(engine.allocate_default(a, host_id, &HashSet::new()).unwrap().is_empty());
            assert!(engine.list(a).unwrap().is_empty());
        }
    }

    #[test]
    fn test_ipv6_only_rejects_ipv4_mapping() {
        let (db, _temp) = temp_db();
        let mut host = nat_host(20000, 20100, 3);
        host.network_type = NetworkType::Ipv6Only;
        let (host_id, a, _) = seed(&db, host);
        let engine = PortEngine::new(db);
        let err = engine
            .add(
                &PortRequest {
                    instance_id: a,
                    host_id,
                    host_port: None,
                    guest_port: 80,
                    protocol: Protocol::Tcp,
                    description: String::new(),
                },
                &HashSet::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
    }

    #[test]
    fn test_add_allocates_from_cursor_and_rejects_duplicates() {
        let (db, _temp) = temp_db();
        let (host_id, a, b) = seed(&db, nat_host(20000, 20100, 3));
        let engine = PortEngine::new(db.clone());
        let req = |instance_id, host_port| PortRequest {
            instance_id,
            host_id,
            host_port,
            guest_port: 8080,
            protocol: Protocol::Tcp,
            description: "app".into(),
        };

        let first = engine.add(&req(a, None), &HashSet::new()).unwrap();
        let second = engine.add(&req(b, None), &HashSet::new()).unwrap();
        let ports = engine.list_by_host(host_id).unwrap();
        let port_of = |id| ports.iter().find(|m| m.id == id).unwrap().host_port;
        assert_eq!(port_of(first), 20000);
        assert_eq!(port_of(second), 20001);

        let err = engine.add(&req(b, Some(20000)), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
    }

    #[test]
    fn test_explicit_port_must_be_in_range_and_free_on_host() {
        let (db, _temp) = temp_db();
        let (host_id, a, _) = seed(&db, nat_host(20000, 20100, 3));
        let engine = PortEngine::new(db.clone());
        let req = |host_port| PortRequest {
            instance_id: a,
            host_id,
            host_port: Some(host_port),
            guest_port: 8080,
            protocol: Protocol::Tcp,
            description: "app".into(),
        };

        let err = engine.add(&req(19999), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
        let err = engine.add(&req(20101), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));

        let bound: HashSet<u16> = [20050].into_iter().collect();
        let err = engine.add(&req(20050), &bound).unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));

        assert!(engine.add(&req(20051), &bound).is_ok());
        assert_eq!(engine.list_by_host(host_id).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_rewinds_cursor() {
        let (db, _temp) = temp_db();
        let (host_id, a, _) = seed(&db, nat_host(20000, 20100, 3));
        let engine = PortEngine::new(db.clone());
        let created = engine.allocate_default(a, host_id, &HashSet::new()).unwrap();

        let removed = engine.remove(created[1].id).unwrap().unwrap();
        assert_eq!(removed.host_port, 20001);
        assert!(engine.remove(created[1].id).unwrap().is_none());
        let host = db.read(|c| hosts::get(c, host_id)).unwrap();
        assert_eq!(host.next_available_port, 20001);
    }

    #[test]
    fn test_release_instance_and_usage_report() {
        let (db, _temp) = temp_db();
        let (host_id, a, b) = seed(&db, nat_host(20000, 20099, 3));
        let engine = PortEngine::new(db);
        engine.allocate_default(a, host_id, &HashSet::new()).unwrap();
        engine.allocate_default(b, host_id, &HashSet::new()).unwrap();

        let usage = engine.usage(host_id).unwrap();
        assert_eq!(usage.total_ports, 100);
        assert_eq!(usage.active_mappings, 6);
        assert_eq!(usage.next_available_port, 20006);

        assert_eq!(engine.release_instance(a).unwrap(), 3);
        let usage = engine.usage(host_id).unwrap();
        assert_eq!(usage.active_mappings, 3);
        assert_eq!(usage.next_available_port, 20000);
    }

    #[test]
    fn test_mark_failed() {
        let (db, _temp) = temp_db();
        let (host_id, a, _) = seed(&db, nat_host(20000, 20100, 1));
        let engine = PortEngine::new(db);
        let created = engine.allocate_default(a, host_id, &HashSet::new()).unwrap();
        engine.mark_failed(created[0].id).unwrap();
        assert_eq!(engine.list(a).unwrap()[0].status, PortStatus::Failed);
    }
}
