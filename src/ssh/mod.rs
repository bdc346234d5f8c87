//! Remote command execution on hypervisor hosts.

pub mod client;
pub mod scripted;

pub use client::{SshClient, SshTarget};
pub use scripted::{Reply, ScriptedShell};

use crate::context::OpContext;
use crate::Result;
use async_trait::async_trait;

/// Sourced before every command so PATH matches an interactive login shell.
pub const ENV_PREAMBLE: &str = "source /etc/profile 2>/dev/null || true; \
     source ~/.bashrc 2>/dev/null || true; \
     source ~/.bash_profile 2>/dev/null || true; \
     export PATH=$PATH:/usr/local/bin:/snap/bin:/usr/sbin:/sbin; ";

/// A shell on a remote host. Every call uses its own short-lived session.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `cmd` and return combined stdout and stderr. A non-zero exit is an error carrying the
    /// output.
    async fn execute(&self, ctx: &OpContext, cmd: &str) -> Result<String>;

    /// Write `content` to `remote_path`, creating parent directories, then chmod to `mode`.
    async fn upload(&self, ctx: &OpContext, content: &[u8], remote_path: &str, mode: i32)
        -> Result<()>;
}

/// Quote a value for safe interpolation into a single-quoted shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
