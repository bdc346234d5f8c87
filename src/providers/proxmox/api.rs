//! Proxmox VE REST API with token authentication.

use super::commands::Guest;
use crate::context::OpContext;
use crate::models::{Host, InstanceType};
use crate::providers::http::{self, base_url, CONNECT_TIMEOUT, REQUEST_TIMEOUT};
use crate::providers::{ImageInfo, RuntimeStatus};
use crate::{ControlError, Result};
use serde::Deserialize;
use tokio::sync::OnceCell;

pub const DEFAULT_PORT: u16 = 8006;

#[derive(Debug, Deserialize)]
struct Data<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Node {
    node: String,
}

#[derive(Debug, Deserialize)]
struct ApiGuest {
    vmid: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct StorageItem {
    volid: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    size: u64,
}

fn kind_path(kind: InstanceType) -> &'static str {
    match kind {
        InstanceType::Vm => "qemu",
        InstanceType::Container => "lxc",
    }
}

pub struct ProxmoxApi {
    base: String,
    token: String,
    storage: String,
    client: OnceCell<reqwest::Client>,
    node: OnceCell<String>,
}

impl ProxmoxApi {
    pub fn new(host: &Host) -> Self {
        Self {
            base: base_url(&host.endpoint, DEFAULT_PORT),
            token: format!(
                "PVEAPIToken={}={}",
                host.api_token_id.clone().unwrap_or_default(),
                host.api_token.clone().unwrap_or_default()
            ),
            storage: if host.storage_pool.is_empty() {
                "local".to_string()
            } else {
                host.storage_pool.clone()
            },
            client: OnceCell::new(),
            node: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                Ok::<_, ControlError>(
                    reqwest::Client::builder()
                        .use_rustls_tls()
                        .danger_accept_invalid_certs(true)
                        .connect_timeout(CONNECT_TIMEOUT)
                        .timeout(REQUEST_TIMEOUT)
                        .build()?,
                )
            })
            .await
    }

    fn get(&self, client: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        client
            .get(format!("{}/api2/json{path}", self.base))
            .header("Authorization", &self.token)
    }

    fn post(&self, client: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        client
            .post(format!("{}/api2/json{path}", self.base))
            .header("Authorization", &self.token)
    }

    /// The first cluster node, looked up once.
    async fn node(&self, ctx: &OpContext) -> Result<&str> {
        let node = self
            .node
            .get_or_try_init(|| async {
                let client = self.client().await?;
                let nodes: Data<Vec<Node>> =
                    http::send_json(ctx, "list nodes", self.get(client, "/nodes")).await?;
                nodes
                    .data
                    .into_iter()
                    .next()
                    .map(|n| n.node)
                    .ok_or_else(|| ControlError::hypervisor("no node in cluster", ""))
            })
            .await?;
        Ok(node.as_str())
    }

    pub fn token_header(&self) -> &str {
        &self.token
    }

    pub async fn ping(&self, ctx: &OpContext) -> Result<()> {
        let client = self.client().await?;
        http::send(ctx, "version", self.get(client, "/version")).await?;
        Ok(())
    }

    pub async fn list_guests(&self, ctx: &OpContext) -> Result<Vec<Guest>> {
        let node = self.node(ctx).await?;
        let client = self.client().await?;
        let mut guests = Vec::new();
        for kind in [InstanceType::Vm, InstanceType::Container] {
            let list: Data<Vec<ApiGuest>> = http::send_json(
                ctx,
                "list guests",
                self.get(client, &format!("/nodes/{node}/{}", kind_path(kind))),
            )
            .await?;
            for g in list.data {
                let vmid = match &g.vmid {
                    serde_json::Value::Number(n) => n.as_u64().map(|v| v as u32),
                    serde_json::Value::String(s) => s.parse().ok(),
                    _ => None,
                };
                let Some(vmid) = vmid else { continue };
                guests.push(Guest {
                    vmid,
                    name: g.name.unwrap_or_else(|| vmid.to_string()),
                    status: if g.status == "running" {
                        RuntimeStatus::Running
                    } else {
                        RuntimeStatus::Stopped
                    },
                    kind,
                });
            }
        }
        Ok(guests)
    }

    /// `start`, `stop` or `reboot`.
    pub async fn change_state(&self, ctx: &OpContext, guest: &Guest, action: &str) -> Result<()> {
        let node = self.node(ctx).await?;
        let client = self.client().await?;
        let path = format!(
            "/nodes/{node}/{}/{}/status/{action}",
            kind_path(guest.kind),
            guest.vmid
        );
        http::send(ctx, action, self.post(client, &path)).await?;
        Ok(())
    }

    pub async fn destroy(&self, ctx: &OpContext, guest: &Guest) -> Result<()> {
        let node = self.node(ctx).await?;
        let client = self.client().await?;
        let url = format!(
            "{}/api2/json/nodes/{node}/{}/{}?purge=1",
            self.base,
            kind_path(guest.kind),
            guest.vmid
        );
        match http::send(
            ctx,
            "destroy",
            client.delete(url).header("Authorization", &self.token),
        )
        .await
        {
            Err(err) if http::is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }

    pub async fn list_images(&self, ctx: &OpContext) -> Result<Vec<ImageInfo>> {
        let node = self.node(ctx).await?;
        let client = self.client().await?;
        let items: Data<Vec<StorageItem>> = http::send_json(
            ctx,
            "list storage content",
            self.get(client, &format!("/nodes/{node}/storage/{}/content", self.storage)),
        )
        .await?;
        Ok(items
            .data
            .into_iter()
            .filter(|i| matches!(i.content.as_str(), "iso" | "vztmpl" | "import"))
            .map(|i| ImageInfo {
                id: i.volid.clone(),
                name: i.volid,
                size: Some(format!("{:.2} MB", i.size as f64 / 1024.0 / 1024.0)),
                description: Some(i.content),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostType;

    #[test]
    fn test_token_header_and_base() {
        let mut host = Host::new("pve", HostType::Proxmox, "10.1.1.1");
        host.api_token_id = Some("root@pam!ctl".into());
        host.api_token = Some("secret".into());
        let api = ProxmoxApi::new(&host);
        assert_eq!(api.token_header(), "PVEAPIToken=root@pam!ctl=secret");
        assert_eq!(api.base, "https://10.1.1.1:8006");
    }

    #[test]
    fn test_guest_rows_accept_numeric_and_string_ids() {
        let rows: Data<Vec<ApiGuest>> = serde_json::from_str(
            r#"{"data": [{"vmid": 101, "name": "a", "status": "running"},
                         {"vmid": "180", "status": "stopped"}]}"#,
        )
        .unwrap();
        assert_eq!(rows.data.len(), 2);
        assert!(rows.data[1].name.is_none());
    }
}
