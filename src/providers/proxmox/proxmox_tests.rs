#[cfg(test)]
mod tests {
    use super::super::ProxmoxProvider;
    use crate::config::ControlConfig;
    use crate::context::OpContext;
    use crate::images::ImageManager;
    use crate::models::{
        ExecutionRule, Host, HostType, InstanceType, MappingMethod, NetworkType, Protocol,
    };
    use crate::providers::{no_progress, InstanceConfig, PortRule, Provider, ProviderDeps};
    use crate::ssh::{Reply, ScriptedShell};
    use crate::ControlError;
    use std::sync::Arc;

    const QM_LIST: &str = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n\
                                 100 pve-a-1f2e           running    1024              20.00 4242\n";

    fn provider(rule: ExecutionRule) -> (ProxmoxProvider, Arc<ScriptedShell>) {
        let mut host = Host::new("pve-a", HostType::Proxmox, "127.0.0.1:1");
        host.execution_rule = rule;
        let shell = Arc::new(ScriptedShell::new());
        let config = ControlConfig::default();
        let deps = ProviderDeps {
            shell: shell.clone(),
            images: Arc::new(ImageManager::new(config.cdn.clone())),
            config: Arc::new(config),
        };
        (ProxmoxProvider::new(host, deps), shell)
    }

    fn vm_config(network_type: NetworkType) -> InstanceConfig {
        InstanceConfig {
            name: "pve-a-1f2e".into(),
            instance_type: InstanceType::Vm,
            image: "debian-12-vm".into(),
            image_url: Some("https://example/debian-12.qcow2".into()),
            cpu: 2,
            memory_mb: 1024,
            disk_mb: 20480,
            bandwidth_mbps: 100,
            password: "Secr3tPass99".into(),
            network_type,
            ports: vec![],
        }
    }

    #[tokio::test]
    async fn test_vm_create_with_ipv6_nat() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("uname -m", Reply::Ok("x86_64\n".into()));
        shell.on("/dev/kvm", Reply::Ok("kvm_available\n".into()));
        shell.on("[ -s '/usr/local/bin/pve_appended", Reply::Ok("present\n".into()));
        shell.on("cat '/usr/local/bin/pve_appended", Reply::Ok("2001:db8:ext::1\n".into()));
        shell.on("pvesm list", Reply::Ok("local:100/vm-100-disk-0.raw\n".into()));

        pve.create_instance(
            &OpContext::background(),
            &vm_config(NetworkType::NatIpv4Ipv6),
            no_progress(),
        )
        .await
        .unwrap();

        assert!(shell.ran("qm create 100 "));
        assert!(shell.ran("--net0 virtio,bridge=vmbr1 --net1 virtio,bridge=vmbr1"));
        assert!(shell.ran("--cpu host"));
        assert!(shell.ran("qm set 100 --ipconfig0 ip=172.16.1.100/24,gw=172.16.1.1"));
        assert!(shell.ran("qm set 100 --ipconfig1 ip6=2001:db8:1::100/64,gw6=2001:db8:1::1"));
        assert!(shell.ran(
            "ip6tables -t nat -A PREROUTING -d 2001:db8:ext::1 -j DNAT --to-destination 2001:db8:1::100"
        ));
        assert!(shell.ran(
            "ip6tables -t nat -A POSTROUTING -s 2001:db8:1::100 -j SNAT --to-source 2001:db8:ext::1"
        ));
        assert!(shell.ran("echo '2001:db8:ext::1' >> '/usr/local/bin/pve_used_vmbr1_ips.txt'"));

        let cmds = shell.commands();
        let pos = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("wget") < pos("qm importdisk 100"));
        assert!(pos("qm create 100") < pos("qm importdisk 100"));
        assert!(pos("--scsi0 local:100/vm-100-disk-0.raw") < pos("qm resize 100 scsi0 20G"));
        assert!(pos("ip6tables -t nat -A") < pos("qm start 100"));
    }

    #[tokio::test]
    async fn test_vm_create_ipv4_only_skips_ipv6_checks() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("pvesm list", Reply::Ok("local:100/vm-100-disk-0.raw\n".into()));
        shell.on("qm list", Reply::Ok(QM_LIST.into()));

        pve.create_instance(
            &OpContext::background(),
            &vm_config(NetworkType::NatIpv4),
            no_progress(),
        )
        .await
        .unwrap();

        assert!(shell.ran("qm create 101 "));
        assert!(!shell.ran("--net1"));
        assert!(!shell.ran("pve_appended_content"));
        assert!(!shell.ran("ip6tables"));
    }

    #[tokio::test]
    async fn test_ipv6_only_without_ipv6_setup_fails() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        let err = pve
            .create_instance(
                &OpContext::background(),
                &vm_config(NetworkType::Ipv6Only),
                no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)));
        assert!(!shell.ran("qm create"));
    }

    #[tokio::test]
    async fn test_api_only_create_is_rejected() {
        let (pve, shell) = provider(ExecutionRule::ApiOnly);
        let err = pve
            .create_instance(
                &OpContext::background(),
                &vm_config(NetworkType::NatIpv4),
                no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_runs_cleanup_in_order() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("qm list", Reply::Ok(QM_LIST.into()));
        shell.on("qm status 100", Reply::Ok("stopped\n".into()));
        shell.on("qm destroy", Reply::Ok(String::new()));

        pve.delete_instance(&OpContext::background(), "pve-a-1f2e")
            .await
            .unwrap();

        let cmds = shell.commands();
        let pos = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("qm unlock 100") < pos("grep -F -- '172.16.1.100:'"));
        assert!(pos("grep -F -- '172.16.1.100:'") < pos("qm stop 100"));
        assert!(pos("qm stop 100") < pos("qm destroy 100 --purge"));
        assert!(pos("qm destroy 100 --purge") < pos("rm -rf /root/vm100"));
        assert!(pos("rm -rf /root/vm100") < pos("172\\.16\\.1\\.100"));
        assert!(pos("172\\.16\\.1\\.100") < pos("ndpresponder"));
    }

    #[tokio::test]
    async fn test_delete_destroy_failure_is_fatal_but_cleanup_failures_are_not() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("qm list", Reply::Ok(QM_LIST.into()));
        shell.on("rm -rf /root/vm100", Reply::Fail("busy".into()));
        pve.delete_instance(&OpContext::background(), "100")
            .await
            .unwrap();

        shell.on("qm destroy", Reply::Fail("unable to destroy".into()));
        let err = pve
            .delete_instance(&OpContext::background(), "100")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Hypervisor { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_guest_is_success() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        let ctx = OpContext::background();
        pve.delete_instance(&ctx, "gone").await.unwrap();
        pve.delete_instance(&ctx, "gone").await.unwrap();
        assert!(!shell.ran("destroy"));
    }

    #[tokio::test]
    async fn test_container_password_requires_running() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on(
            "pct list",
            Reply::Ok("VMID       Status     Lock         Name\n178        stopped                 ct1\n".into()),
        );
        shell.on("pct status 178", Reply::Ok("stopped\n".into()));
        let err = pve
            .set_instance_password(&OpContext::background(), "ct1", "N3wPassword1")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
        assert!(!shell.ran("chpasswd"));
    }

    #[tokio::test]
    async fn test_vm_password_uses_cloud_init_and_reboots() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("qm list", Reply::Ok(QM_LIST.into()));
        shell.on("qm status 100", Reply::Ok("running\n".into()));
        pve.set_instance_password(&OpContext::background(), "100", "N3wPassword1")
            .await
            .unwrap();
        assert!(shell.ran("qm set 100 --cipassword 'N3wPassword1'"));
        assert!(shell.ran("qm reboot 100"));
    }

    #[tokio::test]
    async fn test_port_forward_resolves_private_ip() {
        let (pve, shell) = provider(ExecutionRule::SshOnly);
        shell.on("qm list", Reply::Ok(QM_LIST.into()));
        shell.on("qm config 100 | grep -oP 'ip=", Reply::Ok("172.16.1.100\n".into()));
        let rule = PortRule {
            host_port: 20001,
            guest_port: 22,
            protocol: Protocol::Tcp,
        };
        pve.add_port_forward(&OpContext::background(), "100", None, &rule, MappingMethod::Iptables)
            .await
            .unwrap();
        assert!(shell.ran("-i vmbr0"));
        assert!(shell.ran("--dport 20001 -j DNAT --to-destination 172.16.1.100:22"));
        assert!(shell.ran("POSTROUTING -s 172.16.1.100 -j MASQUERADE"));
        assert!(shell.ran("iptables-save > /etc/iptables/rules.v4"));
    }
}
