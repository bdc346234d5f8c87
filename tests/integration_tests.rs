use fleet_control::config::LevelLimits;
use fleet_control::context::OpContext;
use fleet_control::images::ImageManager;
use fleet_control::models::{
    ExecutionRule, Host, HostType, Image, ImageStatus, InstanceStatus, InstanceType, MappingMethod,
    TaskStatus,
};
use fleet_control::providers::{Provider, RuntimeStatus};
use fleet_control::registry::{ProviderRegistry, StaticShellFactory};
use fleet_control::ssh::{Reply, ScriptedShell};
use fleet_control::state::{hosts, users};
use fleet_control::tasks::TaskManager;
use fleet_control::{ControlConfig, ControlService, CreateRequest, StateDatabase};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RUNNING_JSON: &str = r#"[{"name": "lxd-a-00ff", "status": "Running", "type": "container",
    "state": {"status": "Running", "network": {"eth0": {"addresses": [
        {"family": "inet", "address": "10.0.3.15", "scope": "global"}]}}}}]"#;
const WAIT: Duration = Duration::from_secs(20);

struct TestEnvironment {
    service: ControlService,
    shell: Arc<ScriptedShell>,
    host_id: i64,
    user_id: i64,
    image_id: i64,
    _state_temp: TempDir,
}

/// LXD host `lxd-a` on the auto execution rule, with certificate paths that cannot be read so
/// every API attempt fails and falls back to SSH.
fn create_test_environment() -> TestEnvironment {
    let state_temp = TempDir::new().unwrap();
    let db = StateDatabase::new(&state_temp.path().join("test.db")).unwrap();

    let mut host = Host::new("lxd-a", HostType::Lxd, "127.0.0.1:1");
    host.execution_rule = ExecutionRule::Auto;
    host.api_cert_path = Some("/nonexistent/client.crt".into());
    host.api_key_path = Some("/nonexistent/client.key".into());
    host.ipv4_port_mapping_method = MappingMethod::Native;
    host.node_cpu_cores = 4;
    host.node_memory_mb = 8192;
    host.node_disk_mb = 102400;
    host.default_port_count = 3;

    let (host_id, user_id, image_id) = db
        .write(|tx| {
            let host_id = hosts::insert(tx, &host)?;
            let user_id = users::insert(tx, "alice", 2, 0, 0)?;
            let image_id = fleet_control::state::images::insert(
                tx,
                &Image {
                    id: 0,
                    name: "ubuntu-22.04".into(),
                    os_type: "ubuntu".into(),
                    os_version: "22.04".into(),
                    architecture: "amd64".into(),
                    provider_type: "lxd".into(),
                    instance_type: InstanceType::Container,
                    url: "https://example/ubuntu.tar.xz".into(),
                    status: ImageStatus::Active,
                    description: String::new(),
                    created_at: 0,
                },
            )?;
            Ok((host_id, user_id, image_id))
        })
        .unwrap();

    let shell = Arc::new(ScriptedShell::new());
    shell.on("image info", Reply::Fail("Error: not found".into()));
    shell.on("test -s", Reply::Fail(String::new()));
    shell.on("list --format csv", Reply::Ok("lxd-a-00ff,RUNNING,CONTAINER\n".into()));
    shell.on("list --format json", Reply::Ok(RUNNING_JSON.into()));

    let mut config = ControlConfig::default();
    config.quota.level_limits.insert(
        "2".into(),
        LevelLimits {
            max_instances: 5,
            max_cpu: 4,
            max_memory: 8192,
            max_disk: 51200,
            max_bandwidth: 1000,
            max_traffic: 0,
        },
    );
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
        Arc::new(StaticShellFactory(shell.clone())),
    ));
    let tasks = TaskManager::with_name_suffix(db.clone(), config.clone(), registry.clone(), || {
        "00ff".to_string()
    });

    TestEnvironment {
        service: ControlService::from_parts(db, config, registry, tasks),
        shell,
        host_id,
        user_id,
        image_id,
        _state_temp: state_temp,
    }
}

impl TestEnvironment {
    fn request(&self) -> CreateRequest {
        CreateRequest {
            provider_id: self.host_id,
            image_id: self.image_id,
            cpu_id: "cpu-1".into(),
            memory_id: "mem-512".into(),
            disk_id: "disk-5000".into(),
            bandwidth_id: "bw-300".into(),
            description: String::new(),
        }
    }

    fn host(&self) -> Host {
        self.service
            .db()
            .read(|c| hosts::get(c, self.host_id))
            .unwrap()
    }

    fn used_quota(&self) -> i64 {
        self.service
            .db()
            .read(|c| users::get(c, self.user_id))
            .unwrap()
            .used_quota
    }

    async fn wait_for_command(&self, needle: &str) {
        for _ in 0..400 {
            if self.shell.ran(needle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("command containing '{needle}' never ran");
    }
}

#[tokio::test]
async fn test_lxd_container_create_happy_path() {
    let env = create_test_environment();

    let task = env.service.create_instance(env.user_id, &env.request()).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let done = env.service.tasks().wait_terminal(task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);

    let instances = env.service.list_instances(env.user_id).unwrap();
    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert_eq!(instance.name, "lxd-a-00ff");
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.ssh_port, 10000);
    assert_eq!(instance.private_ip.as_deref(), Some("10.0.3.15"));

    assert_eq!(env.used_quota(), 1006);
    let host = env.host();
    assert_eq!(host.used_cpu_cores, 0);
    assert_eq!(host.used_memory_mb, 512);
    assert_eq!(host.used_disk_mb, 5000);
    assert_eq!(host.container_count, 1);

    // The image was staged and imported over SSH once the API path failed.
    assert!(env.shell.ran("wget"));
    assert!(env.shell.ran("lxc image import"));
    assert!(env.shell.ran("lxc init"));
}

#[tokio::test]
async fn test_lxd_list_falls_back_to_ssh() {
    let env = create_test_environment();
    let provider = env.service.registry().get(env.host_id).unwrap();

    let list = provider
        .list_instances(&OpContext::background())
        .await
        .unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "lxd-a-00ff");
    assert_eq!(list[0].status, RuntimeStatus::Running);
    assert_eq!(list[0].ipv4.as_deref(), Some("10.0.3.15"));
    assert!(env.shell.ran("lxc list --format csv -c n,s,t"));
}

#[tokio::test]
async fn test_cancel_during_image_download() {
    let env = create_test_environment();
    env.shell.on("wget", Reply::Hang);

    let task = env.service.create_instance(env.user_id, &env.request()).unwrap();
    env.wait_for_command("wget").await;

    let view = env
        .service
        .cancel_task(fleet_control::Caller::User(env.user_id), task.id, "用户取消")
        .unwrap();
    assert!(matches!(
        view.task.status,
        TaskStatus::Cancelling | TaskStatus::Cancelled
    ));

    let done = env.service.tasks().wait_terminal(task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);

    let instance = env
        .service
        .db()
        .read(|c| fleet_control::state::instances::get(c, done.instance_id.unwrap()))
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(env.used_quota(), 0);
    let host = env.host();
    assert_eq!(host.used_memory_mb, 0);
    assert_eq!(host.used_disk_mb, 0);
    assert_eq!(host.container_count, 0);
    assert!(!env.shell.ran("lxc init"));
}

#[tokio::test]
async fn test_quota_exhausted_leaves_no_rows() {
    let env = create_test_environment();
    let mut request = env.request();
    request.cpu_id = "cpu-8".into();

    let err = env
        .service
        .create_instance(env.user_id, &request)
        .unwrap_err();
    assert!(err.to_string().contains("CPU resource not enough"), "{err}");
    let (tasks, total) = env
        .service
        .list_tasks(&Default::default())
        .unwrap();
    assert!(tasks.is_empty());
    assert_eq!(total, 0);
    assert_eq!(env.used_quota(), 0);
}
