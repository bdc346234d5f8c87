#[cfg(test)]
mod tests {
    use super::super::{
        is_connection_error, loaded_image, parse_inspect, parse_ps, run_command, DockerProvider,
    };
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

    fn provider(rule: ExecutionRule) -> (DockerProvider, Arc<ScriptedShell>) {
        let mut host = Host::new("dk-a", HostType::Docker, "127.0.0.1:1");
        host.execution_rule = rule;
        let shell = Arc::new(ScriptedShell::new());
        let config = ControlConfig::default();
        let deps = ProviderDeps {
            shell: shell.clone(),
            images: Arc::new(ImageManager::new(config.cdn.clone())),
            config: Arc::new(config),
        };
        (DockerProvider::new(host, deps), shell)
    }

    fn config() -> InstanceConfig {
        InstanceConfig {
            name: "dk-a-9c1d".into(),
            instance_type: InstanceType::Container,
            image: "debian:12".into(),
            image_url: None,
            cpu: 1,
            memory_mb: 256,
            disk_mb: 2048,
            bandwidth_mbps: 100,
            password: "Secr3tPass99".into(),
            network_type: NetworkType::NatIpv4,
            ports: vec![
                PortRule {
                    host_port: 20001,
                    guest_port: 22,
                    protocol: Protocol::Both,
                },
                PortRule {
                    host_port: 20002,
                    guest_port: 20002,
                    protocol: Protocol::Tcp,
                },
            ],
        }
    }

    #[test]
    fn test_run_command_binds_ports() {
        let cmd = run_command(&config(), false);
        assert!(cmd.starts_with("docker run -d --name 'dk-a-9c1d'"));
        assert!(cmd.contains("--cpus 1 --memory 256m"));
        assert!(cmd.contains("-p 0.0.0.0:20001:22/tcp -p 0.0.0.0:20001:22/udp"));
        assert!(cmd.contains("-p 0.0.0.0:20002:20002/tcp"));
        assert!(!cmd.contains("20002/udp"));
        assert!(!cmd.contains("--network"));
        assert!(run_command(&config(), true).contains("--network ipv6_net"));
    }

    #[test]
    fn test_parsers() {
        let info = parse_inspect("/dk-a-9c1d|running|debian:12|abc123|2026-01-01T00:00:00Z\n").unwrap();
        assert_eq!(info.name, "dk-a-9c1d");
        assert_eq!(info.id, "abc123");
        assert_eq!(info.status, RuntimeStatus::Running);
        assert!(matches!(parse_inspect(""), Err(ControlError::InstanceNotFound(_))));

        let rows = parse_ps("a|exited|debian:12|111\nb|running|alpine|222\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, RuntimeStatus::Stopped);

        assert_eq!(loaded_image("Loaded image: debian:12-custom\n"), Some("debian:12-custom"));
        assert_eq!(loaded_image("nothing"), None);
    }

    #[test]
    fn test_connection_errors_are_recognised() {
        assert!(is_connection_error(&ControlError::hypervisor("ssh", "Connection reset by peer")));
        assert!(!is_connection_error(&ControlError::hypervisor("docker rm", "permission denied")));
    }

    #[tokio::test]
    async fn test_create_pulls_runs_and_sets_password() {
        let (docker, shell) = provider(ExecutionRule::Auto);
        docker
            .create_instance(&OpContext::background(), &config(), no_progress())
            .await
            .unwrap();
        let cmds = shell.commands();
        let pos = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("docker pull 'debian:12'") < pos("docker run -d"));
        assert!(pos("docker run -d") < pos("chpasswd"));
    }

    #[tokio::test]
    async fn test_create_loads_archive_and_retags() {
        let (docker, shell) = provider(ExecutionRule::SshOnly);
        shell.on("docker load", Reply::Ok("Loaded image: upstream/debian:12\n".into()));
        let mut cfg = config();
        cfg.image_url = Some("https://example/debian.tar".into());
        docker
            .create_instance(&OpContext::background(), &cfg, no_progress())
            .await
            .unwrap();
        assert!(shell.ran("wget"));
        assert!(shell.ran("docker tag 'upstream/debian:12' 'debian:12'"));
        assert!(!shell.ran("docker pull"));
    }

    #[tokio::test]
    async fn test_api_only_is_rejected() {
        let (docker, shell) = provider(ExecutionRule::ApiOnly);
        let err = docker
            .create_instance(&OpContext::background(), &config(), no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_container_is_success() {
        let (docker, shell) = provider(ExecutionRule::Auto);
        shell.on("docker rm -f", Reply::Fail("Error: No such container: gone".into()));
        let ctx = OpContext::background();
        docker.delete_instance(&ctx, "gone").await.unwrap();
        docker.delete_instance(&ctx, "gone").await.unwrap();
        assert_eq!(shell.count("docker rm -f 'gone'"), 2);
    }

    #[tokio::test]
    async fn test_delete_retries_connection_errors() {
        let (docker, shell) = provider(ExecutionRule::Auto);
        shell.once("docker rm -f", Reply::Fail("connection reset by peer".into()));
        docker
            .delete_instance(&OpContext::background(), "c1")
            .await
            .unwrap();
        assert_eq!(shell.count("docker rm -f 'c1'"), 2);
    }

    #[tokio::test]
    async fn test_incremental_port_forward_is_rejected() {
        let (docker, shell) = provider(ExecutionRule::Auto);
        let rule = PortRule {
            host_port: 20005,
            guest_port: 80,
            protocol: Protocol::Tcp,
        };
        let err = docker
            .add_port_forward(&OpContext::background(), "c1", None, &rule, MappingMethod::Native)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParam(_)));
        assert!(shell.commands().is_empty());
    }
}
