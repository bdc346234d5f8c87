//! LXD/Incus REST API over mutual TLS.

use super::cli::{chpasswd_script, JsonInstance};
use crate::context::OpContext;
use crate::models::{Host, InstanceType};
use crate::providers::http::{self, base_url, CONNECT_TIMEOUT, REQUEST_TIMEOUT};
use crate::providers::units::{disk_arg, memory_arg};
use crate::providers::{ImageInfo, InstanceConfig};
use crate::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::OnceCell;

pub const DEFAULT_PORT: u16 = 8443;

const OPERATION_WAIT_SECS: u64 = 600;

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    operation: String,
    metadata: Option<T>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    source: ImageSource<'a>,
    config: HashMap<&'static str, String>,
    devices: HashMap<&'static str, RootDisk>,
    profiles: [&'static str; 1],
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    alias: &'a str,
}

#[derive(Debug, Serialize)]
struct RootDisk {
    #[serde(rename = "type")]
    kind: &'static str,
    path: &'static str,
    pool: &'static str,
    size: String,
}

#[derive(Debug, Serialize)]
struct StateRequest<'a> {
    action: &'a str,
    timeout: i64,
    force: bool,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: [&'a str; 3],
    #[serde(rename = "wait-for-websocket")]
    wait_for_websocket: bool,
    #[serde(rename = "record-output")]
    record_output: bool,
    interactive: bool,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    source: PullSource<'a>,
    auto_update: bool,
}

#[derive(Debug, Serialize)]
struct PullSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    mode: &'static str,
    server: &'static str,
    protocol: &'static str,
    alias: &'a str,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Option<OperationResult>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationResult {
    #[serde(rename = "return", default)]
    exit_code: i64,
    #[serde(default)]
    output: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    fingerprint: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    aliases: Vec<ApiAlias>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiAlias {
    name: String,
}

/// Lazily built HTTPS client. Building reads the client certificate, so a missing or broken
/// certificate shows up as an API error and lets the caller fall back to SSH.
pub struct LxdApi {
    base: String,
    cert_path: String,
    key_path: String,
    client: OnceCell<reqwest::Client>,
}

impl LxdApi {
    pub fn new(host: &Host) -> Self {
        Self {
            base: base_url(&host.endpoint, DEFAULT_PORT),
            cert_path: host.api_cert_path.clone().unwrap_or_default(),
            key_path: host.api_key_path.clone().unwrap_or_default(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                let mut pem = tokio::fs::read(&self.cert_path).await?;
                pem.push(b'\n');
                pem.extend(tokio::fs::read(&self.key_path).await?);
                let identity = reqwest::Identity::from_pem(&pem)?;
                Ok::<_, ControlError>(
                    reqwest::Client::builder()
                        .use_rustls_tls()
                        .identity(identity)
                        .danger_accept_invalid_certs(true)
                        .connect_timeout(CONNECT_TIMEOUT)
                        .timeout(REQUEST_TIMEOUT)
                        .build()?,
                )
            })
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn ping(&self, ctx: &OpContext) -> Result<()> {
        let client = self.client().await?;
        http::send(ctx, "ping", client.get(self.url("/1.0"))).await?;
        Ok(())
    }

    pub async fn list_instances(&self, ctx: &OpContext) -> Result<Vec<JsonInstance>> {
        let client = self.client().await?;
        let env: Envelope<Vec<JsonInstance>> = http::send_json(
            ctx,
            "list instances",
            client.get(self.url("/1.0/instances?recursion=2")),
        )
        .await?;
        Ok(env.metadata.unwrap_or_default())
    }

    pub async fn get_instance(&self, ctx: &OpContext, name: &str) -> Result<JsonInstance> {
        let client = self.client().await?;
        let req = client.get(self.url(&format!("/1.0/instances/{name}?recursion=1")));
        let env: Envelope<JsonInstance> =
            match http::send_json(ctx, "get instance", req).await {
                Err(err) if http::is_not_found(&err) => {
                    return Err(ControlError::InstanceNotFound(name.to_string()))
                }
                other => other?,
            };
        env.metadata
            .ok_or_else(|| ControlError::InstanceNotFound(name.to_string()))
    }

    /// Follow an async operation to completion.
    async fn wait(&self, ctx: &OpContext, operation: &str) -> Result<OperationResult> {
        if operation.is_empty() {
            return Ok(OperationResult::default());
        }
        let client = self.client().await?;
        let url = self.url(&format!("{operation}/wait?timeout={OPERATION_WAIT_SECS}"));
        let env: Envelope<Operation> = http::send_json(
            ctx,
            "wait operation",
            client
                .get(url)
                .timeout(std::time::Duration::from_secs(OPERATION_WAIT_SECS + 30)),
        )
        .await?;
        let op = env
            .metadata
            .ok_or_else(|| ControlError::hypervisor("operation returned no metadata", operation))?;
        if op.status != "Success" {
            return Err(ControlError::hypervisor(
                format!("operation {operation} ended as {}", op.status),
                op.err,
            ));
        }
        Ok(op.metadata.unwrap_or_default())
    }

    pub async fn create(&self, ctx: &OpContext, config: &InstanceConfig) -> Result<()> {
        let mut limits = HashMap::new();
        if config.cpu > 0 {
            limits.insert("limits.cpu", config.cpu.to_string());
        }
        if config.memory_mb > 0 {
            limits.insert("limits.memory", memory_arg(config.memory_mb));
        }
        let mut devices = HashMap::new();
        if config.disk_mb > 0 {
            devices.insert(
                "root",
                RootDisk {
                    kind: "disk",
                    path: "/",
                    pool: "default",
                    size: disk_arg(config.disk_mb),
                },
            );
        }
        let body = CreateRequest {
            name: &config.name,
            kind: match config.instance_type {
                InstanceType::Vm => "virtual-machine",
                InstanceType::Container => "container",
            },
            source: ImageSource {
                kind: "image",
                alias: &config.image,
            },
            config: limits,
            devices,
            profiles: ["default"],
        };
        let client = self.client().await?;
        let env: Envelope<serde_json::Value> = http::send_json(
            ctx,
            "create instance",
            client.post(self.url("/1.0/instances")).json(&body),
        )
        .await?;
        self.wait(ctx, &env.operation).await?;
        Ok(())
    }

    pub async fn change_state(&self, ctx: &OpContext, name: &str, action: &str) -> Result<()> {
        let client = self.client().await?;
        let body = StateRequest {
            action,
            timeout: 30,
            force: false,
        };
        let env: Envelope<serde_json::Value> = http::send_json(
            ctx,
            action,
            client
                .put(self.url(&format!("/1.0/instances/{name}/state")))
                .json(&body),
        )
        .await?;
        self.wait(ctx, &env.operation).await?;
        Ok(())
    }

    pub async fn delete(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let client = self.client().await?;
        let stop = StateRequest {
            action: "stop",
            timeout: 30,
            force: true,
        };
        // Running instances cannot be deleted; a stop on a stopped instance fails harmlessly.
        if let Ok(env) = http::send_json::<Envelope<serde_json::Value>>(
            ctx,
            "stop",
            client
                .put(self.url(&format!("/1.0/instances/{name}/state")))
                .json(&stop),
        )
        .await
        {
            let _ = self.wait(ctx, &env.operation).await;
        }
        ctx.check()?;
        let env: Envelope<serde_json::Value> = match http::send_json(
            ctx,
            "delete instance",
            client.delete(self.url(&format!("/1.0/instances/{name}"))),
        )
        .await
        {
            Err(err) if http::is_not_found(&err) => return Ok(()),
            other => other?,
        };
        self.wait(ctx, &env.operation).await?;
        Ok(())
    }

    /// Run a script and return its stdout.
    pub async fn exec(&self, ctx: &OpContext, name: &str, script: &str) -> Result<String> {
        let client = self.client().await?;
        let body = ExecRequest {
            command: ["bash", "-c", script],
            wait_for_websocket: false,
            record_output: true,
            interactive: false,
        };
        let env: Envelope<serde_json::Value> = http::send_json(
            ctx,
            "exec",
            client
                .post(self.url(&format!("/1.0/instances/{name}/exec")))
                .json(&body),
        )
        .await?;
        let result = self.wait(ctx, &env.operation).await?;
        let stdout = match result.output.get("1") {
            Some(path) => {
                let resp = http::send(ctx, "exec output", client.get(self.url(path))).await?;
                ctx.run(async { Ok(resp.text().await?) }).await?
            }
            None => String::new(),
        };
        if result.exit_code != 0 {
            return Err(ControlError::hypervisor(
                format!("command exited with status {}", result.exit_code),
                stdout,
            ));
        }
        Ok(stdout)
    }

    pub async fn set_password(&self, ctx: &OpContext, name: &str, password: &str) -> Result<()> {
        self.exec(ctx, name, &chpasswd_script(password)).await?;
        Ok(())
    }

    pub async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>> {
        let client = self.client().await?;
        let env: Envelope<Vec<ApiImage>> = http::send_json(
            ctx,
            "list images",
            client.get(self.url("/1.0/images?recursion=1")),
        )
        .await?;
        Ok(env
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|img| ImageInfo {
                id: img.fingerprint.get(..12).unwrap_or(&img.fingerprint).to_string(),
                name: img
                    .aliases
                    .first()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                size: Some(format!("{:.2} MB", img.size as f64 / 1024.0 / 1024.0)),
                description: img.properties.get("description").cloned(),
            })
            .collect())
    }

    pub async fn pull_image(&self, ctx: &OpContext, alias: &str) -> Result<()> {
        let client = self.client().await?;
        let body = PullRequest {
            source: PullSource {
                kind: "image",
                mode: "pull",
                server: "https://images.linuxcontainers.org",
                protocol: "simplestreams",
                alias,
            },
            auto_update: false,
        };
        let env: Envelope<serde_json::Value> = http::send_json(
            ctx,
            "pull image",
            client.post(self.url("/1.0/images")).json(&body),
        )
        .await?;
        self.wait(ctx, &env.operation).await?;
        Ok(())
    }

    pub async fn delete_image(&self, ctx: &OpContext, fingerprint: &str) -> Result<()> {
        let client = self.client().await?;
        let env: Envelope<serde_json::Value> = http::send_json(
            ctx,
            "delete image",
            client.delete(self.url(&format!("/1.0/images/{fingerprint}"))),
        )
        .await?;
        self.wait(ctx, &env.operation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostType, NetworkType};

    #[test]
    fn test_create_body_shape() {
        let config = InstanceConfig {
            name: "c1".into(),
            instance_type: InstanceType::Vm,
            image: "ubuntu-22.04".into(),
            image_url: None,
            cpu: 2,
            memory_mb: 1024,
            disk_mb: 10240,
            bandwidth_mbps: 100,
            password: String::new(),
            network_type: NetworkType::NatIpv4,
            ports: vec![],
        };
        let body = CreateRequest {
            name: &config.name,
            kind: "virtual-machine",
            source: ImageSource {
                kind: "image",
                alias: &config.image,
            },
            config: HashMap::from([("limits.memory", memory_arg(config.memory_mb))]),
            devices: HashMap::from([(
                "root",
                RootDisk {
                    kind: "disk",
                    path: "/",
                    pool: "default",
                    size: disk_arg(config.disk_mb),
                },
            )]),
            profiles: ["default"],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "virtual-machine");
        assert_eq!(json["source"]["alias"], "ubuntu-22.04");
        assert_eq!(json["config"]["limits.memory"], "1024MiB");
        assert_eq!(json["devices"]["root"]["size"], "10GiB");
        assert_eq!(json["profiles"][0], "default");
    }

    #[tokio::test]
    async fn test_missing_certificate_is_an_error() {
        let mut host = Host::new("lxd-a", HostType::Lxd, "127.0.0.1:1");
        host.api_cert_path = Some("/nonexistent/client.crt".into());
        host.api_key_path = Some("/nonexistent/client.key".into());
        let api = LxdApi::new(&host);
        assert!(api.ping(&OpContext::background()).await.is_err());
    }
}
