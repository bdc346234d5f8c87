#[cfg(test)]
mod tests {
    use super::super::{LxdFlavor, LxdProvider};
    use crate::config::ControlConfig;
    use crate::context::OpContext;
    use crate::images::ImageManager;
    use crate::models::{
        ExecutionRule, Host, HostType, InstanceType, MappingMethod, NetworkType, Protocol,
    };
    use crate::providers::{
        no_progress, InstanceConfig, PortRule, Provider, ProviderDeps, RuntimeStatus,
    };
    use crate::ssh::{Reply, ScriptedShell};
    use crate::ControlError;
    use std::sync::Arc;

    const RUNNING_JSON: &str = r#"[{"name": "lxd-a-00ff", "status": "Running", "type": "container",
        "state": {"status": "Running", "network": {"eth0": {"addresses": [
            {"family": "inet", "address": "10.0.3.15", "scope": "global"}]}}}}]"#;

    fn host(rule: ExecutionRule) -> Host {
        let mut host = Host::new("lxd-a", HostType::Lxd, "127.0.0.1:1");
        host.execution_rule = rule;
        host
    }

    fn provider(host: Host, flavor: LxdFlavor) -> (LxdProvider, Arc<ScriptedShell>) {
        let shell = Arc::new(ScriptedShell::new());
        let config = ControlConfig::default();
        let deps = ProviderDeps {
            shell: shell.clone(),
            images: Arc::new(ImageManager::new(config.cdn.clone())),
            config: Arc::new(config),
        };
        (LxdProvider::new(host, flavor, deps), shell)
    }

    fn instance_config() -> InstanceConfig {
        InstanceConfig {
            name: "lxd-a-00ff".into(),
            instance_type: InstanceType::Container,
            image: "ubuntu-22.04".into(),
            image_url: Some("https://example/ubuntu.tar.xz".into()),
            cpu: 1,
            memory_mb: 512,
            disk_mb: 5000,
            bandwidth_mbps: 300,
            password: "Secr3tPass99".into(),
            network_type: NetworkType::NatIpv4,
            ports: vec![],
        }
    }

    #[tokio::test]
    async fn test_ssh_create_downloads_imports_and_sets_password() {
        let (lxd, shell) = provider(host(ExecutionRule::SshOnly), LxdFlavor::Lxd);
        shell.on("image info", Reply::Fail("Error: not found".into()));
        shell.on("test -s", Reply::Fail(String::new()));
        shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

        lxd.create_instance(&OpContext::background(), &instance_config(), no_progress())
            .await
            .unwrap();

        let cmds = shell.commands();
        let pos = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("wget") < pos("lxc image import"));
        assert!(pos("lxc image import") < pos("lxc init"));
        assert!(pos("lxc init") < pos("lxc start"));
        assert!(pos("lxc start") < pos("chpasswd"));
        assert!(shell.ran("--alias 'ubuntu-22.04'"));
        assert!(shell.ran(
            "lxc init 'ubuntu-22.04' 'lxd-a-00ff' -c limits.cpu=1 -c limits.memory=512MiB -d root,size=5000MiB"
        ));
        assert!(shell.ran(r#"lxc exec 'lxd-a-00ff' -- bash -c 'echo "root:Secr3tPass99" | chpasswd'"#));
    }

    #[tokio::test]
    async fn test_imported_alias_skips_download() {
        let (lxd, shell) = provider(host(ExecutionRule::SshOnly), LxdFlavor::Incus);
        shell.on("image info", Reply::Ok("exists\n".into()));
        shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

        lxd.create_instance(&OpContext::background(), &instance_config(), no_progress())
            .await
            .unwrap();
        assert!(!shell.ran("wget"));
        assert!(shell.ran("incus init"));
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_ssh_when_api_unreachable() {
        let mut h = host(ExecutionRule::Auto);
        h.api_cert_path = Some("/nonexistent/client.crt".into());
        h.api_key_path = Some("/nonexistent/client.key".into());
        let (lxd, shell) = provider(h, LxdFlavor::Lxd);
        shell.on("list --format csv", Reply::Ok("lxd-a-00ff,RUNNING,CONTAINER\n".into()));
        shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

        let list = lxd.list_instances(&OpContext::background()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, RuntimeStatus::Running);
        assert_eq!(list[0].ipv4.as_deref(), Some("10.0.3.15"));
        assert!(shell.ran("lxc list --format csv -c n,s,t"));
    }

    #[tokio::test]
    async fn test_api_only_without_credentials_fails_before_side_effects() {
        let (lxd, shell) = provider(host(ExecutionRule::ApiOnly), LxdFlavor::Lxd);
        let err = lxd
            .create_instance(&OpContext::background(), &instance_config(), no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_instance_is_success() {
        let (lxd, shell) = provider(host(ExecutionRule::SshOnly), LxdFlavor::Lxd);
        shell.on("lxc delete", Reply::Fail("Error: Instance not found".into()));
        let ctx = OpContext::background();
        lxd.delete_instance(&ctx, "gone").await.unwrap();
        lxd.delete_instance(&ctx, "gone").await.unwrap();
        assert_eq!(shell.count("lxc delete 'gone' --force"), 2);
    }

    #[tokio::test]
    async fn test_get_missing_instance_is_not_found() {
        let (lxd, shell) = provider(host(ExecutionRule::SshOnly), LxdFlavor::Lxd);
        shell.on("list --format json", Reply::Ok("[]".into()));
        let err = lxd
            .get_instance(&OpContext::background(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_port_forward_methods() {
        let (lxd, shell) = provider(host(ExecutionRule::SshOnly), LxdFlavor::Lxd);
        let ctx = OpContext::background();
        let rule = PortRule {
            host_port: 20001,
            guest_port: 22,
            protocol: Protocol::Tcp,
        };
        lxd.add_port_forward(&ctx, "c1", None, &rule, MappingMethod::Native)
            .await
            .unwrap();
        assert!(shell.ran(
            "lxc config device add 'c1' port20001 proxy listen=tcp:0.0.0.0:20001 connect=tcp:127.0.0.1:22"
        ));

        let err = lxd
            .add_port_forward(&ctx, "c1", None, &rule, MappingMethod::Iptables)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));

        lxd.add_port_forward(&ctx, "c1", Some("10.0.3.15"), &rule, MappingMethod::Iptables)
            .await
            .unwrap();
        assert!(shell.ran("--dport 20001 -j DNAT --to-destination 10.0.3.15:22"));
        assert!(shell.ran("iptables-save > /etc/iptables/rules.v4"));
    }
}
