use super::cdn::CdnSelector;
use crate::config::CdnConfig;
use crate::context::OpContext;
use crate::models::{HostType, InstanceType};
use crate::ssh::{shell_quote, RemoteShell};
use crate::{ControlError, Result};
use md5::{Digest, Md5};

/// An image to materialise on a host.
#[derive(Debug, Clone)]
pub struct ImageRequest<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub architecture: &'a str,
    pub host_type: HostType,
    pub instance_type: InstanceType,
}

/// Host directory holding downloaded images for a hypervisor and instance type.
pub fn cache_dir(host_type: HostType, instance_type: InstanceType) -> &'static str {
    match (host_type, instance_type) {
        (HostType::Proxmox, InstanceType::Vm) => "/root/qcow",
        (HostType::Proxmox, InstanceType::Container) => "/var/lib/vz/template/cache",
        (HostType::Lxd, _) => "/usr/local/bin/lxd_images",
        (HostType::Incus, _) => "/usr/local/bin/incus_images",
        (HostType::Docker, _) => "/usr/local/bin/docker_ct_images",
    }
}

fn extension_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    [
        ".tar.xz", ".tar.gz", ".qcow2", ".iso", ".zip", ".img", ".tar",
    ]
    .into_iter()
    .find(|ext| path.ends_with(ext))
    .unwrap_or(".img")
}

/// Cache file name: `md5(name|url|arch)` in hex plus an extension taken from the URL.
pub fn cache_file_name(name: &str, url: &str, architecture: &str) -> String {
    let digest = Md5::digest(format!("{name}|{url}|{architecture}").as_bytes());
    format!("{}{}", hex::encode(digest), extension_for(url))
}

/// Shell command downloading `url` into `tmp` and renaming it over `path` on success.
pub fn download_command(url: &str, tmp: &str, path: &str) -> String {
    let (url, tmp, path) = (shell_quote(url), shell_quote(tmp), shell_quote(path));
    format!(
        "{{ wget --no-check-certificate --timeout=1800 -q -O {tmp} {url} || \
         curl -L -k --max-time 1800 --retry 3 --retry-delay 5 -o {tmp} {url}; }} && \
         mv -f {tmp} {path}"
    )
}

/// Downloads catalog images onto hosts on demand.
pub struct ImageManager {
    cdn: CdnSelector,
}

impl ImageManager {
    pub fn new(cdn: CdnConfig) -> Self {
        Self {
            cdn: CdnSelector::new(cdn),
        }
    }

    /// Make sure the image file exists on the host and return its path. An existing non-empty
    /// file is reused. Interrupted downloads leave their `.tmp` file behind; the next pull
    /// overwrites it.
    pub async fn ensure_on_host(
        &self,
        ctx: &OpContext,
        shell: &dyn RemoteShell,
        host_name: &str,
        req: &ImageRequest<'_>,
    ) -> Result<String> {
        if req.url.is_empty() {
            return Err(ControlError::InvalidParam(format!(
                "image {} has no download url",
                req.name
            )));
        }
        let dir = cache_dir(req.host_type, req.instance_type);
        let path = format!(
            "{dir}/{}",
            cache_file_name(req.name, req.url, req.architecture)
        );
        let quoted = shell_quote(&path);

        match shell
            .execute(ctx, &format!("test -s {quoted} && echo cached"))
            .await
        {
            Ok(out) if out.contains("cached") => {
                tracing::info!(host = host_name, image = req.name, path = %path, "镜像已存在，跳过下载");
                return Ok(path);
            }
            Err(err) if err.is_interrupt() => return Err(err),
            _ => {}
        }
        shell
            .execute(ctx, &format!("mkdir -p {}", shell_quote(dir)))
            .await?;

        let mut sources = Vec::new();
        if let Some(cdn) = self.cdn.select(ctx, shell, host_name).await? {
            if req.url.starts_with("http") {
                sources.push(format!("{cdn}{}", req.url));
            }
        }
        sources.push(req.url.to_string());

        let tmp = format!("{path}.tmp");
        let mut last_err = None;
        for source in &sources {
            tracing::info!(host = host_name, image = req.name, url = %source, "开始下载镜像");
            match shell.execute(ctx, &download_command(source, &tmp, &path)).await {
                Ok(_) => {
                    tracing::info!(host = host_name, image = req.name, path = %path, "镜像下载完成");
                    return Ok(path);
                }
                Err(err) if err.is_interrupt() => return Err(err),
                Err(err) => {
                    tracing::warn!(host = host_name, url = %source, error = %err, "下载失败，尝试下一个来源");
                    let _ = shell
                        .execute(ctx, &format!("rm -f {}", shell_quote(&tmp)))
                        .await;
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ControlError::hypervisor(format!("image {} download failed", req.name), "")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{Reply, ScriptedShell};

    fn request<'a>(url: &'a str) -> ImageRequest<'a> {
        ImageRequest {
            name: "debian-12-vm",
            url,
            architecture: "amd64",
            host_type: HostType::Proxmox,
            instance_type: InstanceType::Vm,
        }
    }

    #[test]
    fn test_cache_file_name_is_stable() {
        let a = cache_file_name("ubuntu", "https://x/ubuntu.tar.xz", "amd64");
        let b = cache_file_name("ubuntu", "https://x/ubuntu.tar.xz", "amd64");
        assert_eq!(a, b);
        assert!(a.ends_with(".tar.xz"));
        assert_eq!(a.len(), 32 + ".tar.xz".len());
        assert_ne!(a, cache_file_name("ubuntu", "https://x/ubuntu.tar.xz", "arm64"));
        assert!(cache_file_name("d", "https://x/disk.qcow2?sig=1", "amd64").ends_with(".qcow2"));
        assert!(cache_file_name("d", "https://x/blob", "amd64").ends_with(".img"));
    }

    #[tokio::test]
    async fn test_existing_file_skips_download() {
        let shell = ScriptedShell::new();
        shell.on("test -s", Reply::Ok("cached\n".into()));
        let manager = ImageManager::new(CdnConfig::default());
        let path = manager
            .ensure_on_host(&OpContext::background(), &shell, "pve", &request("https://x/d.qcow2"))
            .await
            .unwrap();
        assert!(path.starts_with("/root/qcow/"));
        assert!(!shell.ran("wget"));
    }

    #[tokio::test]
    async fn test_cdn_failure_falls_back_to_origin() {
        let shell = ScriptedShell::new();
        shell.on("test -s", Reply::Fail(String::new()));
        shell.on("grep -q success", Reply::Ok("success".into()));
        shell.on("https://cdn.example/https://x/d.qcow2", Reply::Fail("404".into()));
        let manager = ImageManager::new(CdnConfig {
            endpoints: vec!["https://cdn.example/".into()],
            test_url: "https://raw/test".into(),
        });
        let path = manager
            .ensure_on_host(&OpContext::background(), &shell, "pve", &request("https://x/d.qcow2"))
            .await
            .unwrap();
        assert!(path.ends_with(".qcow2"));
        assert_eq!(shell.count("wget"), 2);
        assert_eq!(shell.count("rm -f"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_tmp_file() {
        let shell = ScriptedShell::new();
        shell.on("test -s", Reply::Fail(String::new()));
        shell.on("wget", Reply::Hang);
        let manager = ImageManager::new(CdnConfig::default());
        let ctx = OpContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = manager
            .ensure_on_host(&ctx, &shell, "pve", &request("https://x/d.qcow2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Cancelled(_)));
        assert!(!shell.ran("rm -f"));
    }
}
