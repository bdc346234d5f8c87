use super::{RemoteShell, ENV_PREAMBLE};
use crate::config::SshSettings;
use crate::context::OpContext;
use crate::models::Host;
use crate::{ControlError, Result};
use async_trait::async_trait;
use ssh2::{FileStat, PtyModeOpcode, PtyModes, Session};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how to log in.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
}

impl SshTarget {
    pub fn from_host(host: &Host, settings: &SshSettings) -> Self {
        Self {
            host: host.address(),
            port: host.ssh_port,
            username: host.ssh_user.clone(),
            password: host.ssh_password.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            exec_timeout: Duration::from_secs(settings.exec_timeout_secs),
        }
    }

    fn address(&self) -> String {
        if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Password-authenticated SSH client. Host keys are not verified.
#[derive(Debug, Clone)]
pub struct SshClient {
    target: SshTarget,
}

impl SshClient {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Connect and authenticate. Also returns a clone of the TCP stream so the caller can tear
    /// the connection down from another thread.
    fn open_session(target: &SshTarget) -> Result<(Session, TcpStream)> {
        let address = target.address();
        let socket = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ControlError::HostUnavailable(format!("cannot resolve {address}")))?;
        let tcp = TcpStream::connect_timeout(&socket, target.connect_timeout).map_err(|e| {
            ControlError::HostUnavailable(format!("TCP connection to {address} failed: {e}"))
        })?;
        let killer = tcp.try_clone()?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(target.exec_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake()?;
        session.userauth_password(&target.username, &target.password)?;
        if !session.authenticated() {
            return Err(ControlError::HostUnavailable(format!(
                "SSH authentication failed for {}@{}",
                target.username, address
            )));
        }
        Ok((session, killer))
    }

    fn run_command(session: Session, command: &str) -> Result<(i32, String)> {
        let mut channel = session.channel_session()?;
        let mut modes = PtyModes::new();
        modes.set_boolean(PtyModeOpcode::ECHO, false);
        channel.request_pty("xterm", Some(modes), Some((80, 40, 0, 0)))?;
        channel.exec(command)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;
        channel.wait_close()?;
        let status = channel.exit_status()?;

        stdout.extend_from_slice(&stderr);
        let output = String::from_utf8_lossy(&stdout).replace("\r\n", "\n");
        Ok((status, output))
    }

    fn write_file(session: Session, content: &[u8], remote_path: &str, mode: i32) -> Result<()> {
        let sftp = session.sftp()?;
        let path = Path::new(remote_path);
        if let Some(parent) = path.parent() {
            let mut prefix = PathBuf::new();
            for component in parent.components() {
                prefix.push(component);
                if prefix.as_os_str() == "/" {
                    continue;
                }
                // Already-existing directories fail here; that is fine.
                let _ = sftp.mkdir(&prefix, 0o755);
            }
        }
        let mut file = sftp.create(path)?;
        file.write_all(content)?;
        drop(file);
        sftp.setstat(
            path,
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode as u32),
                atime: None,
                mtime: None,
            },
        )?;
        Ok(())
    }

    async fn connect(&self, ctx: &OpContext) -> Result<(Session, TcpStream)> {
        let target = self.target.clone();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || Self::open_session(&target))
                .await
                .map_err(|e| ControlError::Internal(format!("ssh connect task failed: {e}")))?
        })
        .await
    }

    /// Wait for a blocking job, killing the connection if the context or the exec timeout
    /// fires first. Closing the socket drops the PTY, which kills the remote process.
    async fn supervise<T: Send + 'static>(
        &self,
        ctx: &OpContext,
        killer: TcpStream,
        job: tokio::task::JoinHandle<Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            res = job => {
                res.map_err(|e| ControlError::Internal(format!("ssh task failed: {e}")))?
            }
            _ = ctx.done() => {
                let _ = killer.shutdown(Shutdown::Both);
                Err(ctx.err())
            }
            _ = tokio::time::sleep(self.target.exec_timeout) => {
                let _ = killer.shutdown(Shutdown::Both);
                Err(ControlError::Timeout(format!(
                    "ssh command exceeded {}s on {}",
                    self.target.exec_timeout.as_secs(),
                    self.target.host
                )))
            }
        }
    }
}

#[async_trait]
impl RemoteShell for SshClient {
    async fn execute(&self, ctx: &OpContext, cmd: &str) -> Result<String> {
        tracing::debug!(host = %self.target.host, command = %cmd, "ssh exec");
        let (session, killer) = self.connect(ctx).await?;
        let full = format!("{ENV_PREAMBLE}{cmd}");
        let job = tokio::task::spawn_blocking(move || Self::run_command(session, &full));
        let (status, output) = self.supervise(ctx, killer, job).await?;
        if status != 0 {
            tracing::debug!(host = %self.target.host, status, "ssh command failed");
            return Err(ControlError::hypervisor(
                format!("command exited with status {status}"),
                output,
            ));
        }
        Ok(output)
    }

    async fn upload(
        &self,
        ctx: &OpContext,
        content: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<()> {
        tracing::debug!(host = %self.target.host, path = %remote_path, "sftp upload");
        let (session, killer) = self.connect(ctx).await?;
        let content = content.to_vec();
        let path = remote_path.to_string();
        let job =
            tokio::task::spawn_blocking(move || Self::write_file(session, &content, &path, mode));
        self.supervise(ctx, killer, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port: 2222,
            username: "root".into(),
            password: "pw".into(),
            connect_timeout: Duration::from_millis(200),
            exec_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_address_formats() {
        assert_eq!(target("10.0.0.1").address(), "10.0.0.1:2222");
        assert_eq!(target("2001:db8::1").address(), "[2001:db8::1]:2222");
        assert_eq!(target("example.com:22").address(), "example.com:22");
    }

    #[tokio::test]
    async fn test_connection_refused_is_host_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut t = target("127.0.0.1");
        t.port = port;
        let client = SshClient::new(t);
        let err = client
            .execute(&OpContext::background(), "true")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::HostUnavailable(_)));
    }
}
