#[cfg(test)]
mod tests {
    use super::super::{parse_listening_ports, probe_listening_ports, PortAllocator};
    use crate::context::OpContext;
    use crate::ssh::{Reply, ScriptedShell};
    use std::collections::HashSet;

    #[test]
    fn test_allocate_first_port() {
        let allocator = PortAllocator::new(20000, 20010);
        assert_eq!(allocator.next_free(20000, |_| false), Some(20000));
    }

    #[test]
    fn test_skips_taken_ports() {
        let allocator = PortAllocator::new(20000, 20010);
        let taken: HashSet<u16> = [20000, 20001].into_iter().collect();
        assert_eq!(allocator.next_free(20000, |p| taken.contains(&p)), Some(20002));
    }

    #[test]
    fn test_wraps_to_range_start() {
        let allocator = PortAllocator::new(20000, 20003);
        let taken: HashSet<u16> = [20002, 20003].into_iter().collect();
        assert_eq!(allocator.next_free(20002, |p| taken.contains(&p)), Some(20000));
    }

    #[test]
    fn test_cursor_outside_range_starts_at_beginning() {
        let allocator = PortAllocator::new(20000, 20003);
        assert_eq!(allocator.next_free(10000, |_| false), Some(20000));
    }

    #[test]
    fn test_exhausted_range() {
        let allocator = PortAllocator::new(20000, 20002);
        assert_eq!(allocator.next_free(20001, |_| true), None);
        assert_eq!(allocator.next_free_forward(20000, |_| true), None);
    }

    #[test]
    fn test_forward_search_does_not_wrap() {
        let allocator = PortAllocator::new(20000, 20003);
        assert_eq!(allocator.next_free_forward(20003, |p| p == 20003), None);
        assert_eq!(allocator.next_free_forward(19000, |_| false), Some(20000));
    }

    #[test]
    fn test_after_wraps_at_range_end() {
        let allocator = PortAllocator::new(20000, 20003);
        assert_eq!(allocator.after(20001), 20002);
        assert_eq!(allocator.after(20003), 20000);
        assert_eq!(allocator.range_size(), 4);
        assert_eq!(PortAllocator::new(5, 1).range_size(), 0);
    }

    #[test]
    fn test_parse_ss_and_netstat_output() {
        let ss = "Netid State  Recv-Q Send-Q Local Address:Port Peer Address:Port\n\
                  tcp   LISTEN 0      128    0.0.0.0:22         0.0.0.0:*\n\
                  tcp   LISTEN 0      128    [::]:20005         [::]:*\n\
                  udp   UNCONN 0      0      127.0.0.53%lo:53   0.0.0.0:*\n";
        let ports = parse_listening_ports(ss);
        assert!(ports.contains(&22));
        assert!(ports.contains(&20005));
        assert!(ports.contains(&53));
        assert_eq!(ports.len(), 3);

        let netstat = "Active Internet connections (only servers)\n\
                       Proto Recv-Q Send-Q Local Address  Foreign Address State\n\
                       tcp        0      0 0.0.0.0:8080   0.0.0.0:*       LISTEN\n";
        assert_eq!(
            parse_listening_ports(netstat),
            [8080].into_iter().collect::<HashSet<u16>>()
        );
    }

    #[tokio::test]
    async fn test_probe_failure_yields_empty_set() {
        let shell = ScriptedShell::new();
        shell.on("ss -tuln", Reply::Fail("ssh down".into()));
        let ports = probe_listening_ports(&shell, &OpContext::background()).await;
        assert!(ports.is_empty());
    }
}
