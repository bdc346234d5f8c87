use super::RemoteShell;
use crate::context::OpContext;
use crate::{ControlError, Result};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

/// How a scripted command answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    /// Non-zero exit with this output.
    Fail(String),
    /// Block until the caller's context is cancelled or times out.
    Hang,
}

struct Rule {
    needle: String,
    reply: Reply,
    once: bool,
}

/// In-memory `RemoteShell` answering from a rule table. Every command is recorded. Rules match
/// by substring; the most recently added matching rule wins and unmatched commands succeed
/// with empty output. Adapter tests drive hypervisors through it.
#[derive(Default)]
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, needle: &str, reply: Reply) -> &Self {
        self.push(needle, reply, false)
    }

    /// Like `on`, but the rule is consumed by its first match.
    pub fn once(&self, needle: &str, reply: Reply) -> &Self {
        self.push(needle, reply, true)
    }

    fn push(&self, needle: &str, reply: Reply, once: bool) -> &Self {
        guard(&self.rules).push(Rule {
            needle: needle.to_string(),
            reply,
            once,
        });
        self
    }

    pub fn commands(&self) -> Vec<String> {
        guard(&self.log).clone()
    }

    /// Whether any recorded command contains `needle`.
    pub fn ran(&self, needle: &str) -> bool {
        guard(&self.log).iter().any(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        guard(&self.log).iter().filter(|c| c.contains(needle)).count()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        guard(&self.uploads).clone()
    }

    fn answer(&self, cmd: &str) -> Option<Reply> {
        let mut rules = guard(&self.rules);
        let idx = rules.iter().rposition(|r| cmd.contains(&r.needle))?;
        if rules[idx].once {
            Some(rules.remove(idx).reply)
        } else {
            Some(rules[idx].reply.clone())
        }
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn execute(&self, ctx: &OpContext, cmd: &str) -> Result<String> {
        ctx.check()?;
        guard(&self.log).push(cmd.to_string());
        match self.answer(cmd) {
            None => Ok(String::new()),
            Some(Reply::Ok(out)) => Ok(out),
            Some(Reply::Fail(out)) => Err(ControlError::hypervisor(
                "command exited with status 1",
                out,
            )),
            Some(Reply::Hang) => {
                ctx.done().await;
                Err(ctx.err())
            }
        }
    }

    async fn upload(
        &self,
        ctx: &OpContext,
        content: &[u8],
        remote_path: &str,
        _mode: i32,
    ) -> Result<()> {
        ctx.check()?;
        guard(&self.uploads).push((remote_path.to_string(), content.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_rule_wins_and_once_is_consumed() {
        let shell = ScriptedShell::new();
        shell.on("lxc list", Reply::Ok("old".into()));
        shell.once("lxc list", Reply::Ok("new".into()));
        let ctx = OpContext::background();
        assert_eq!(shell.execute(&ctx, "lxc list").await.unwrap(), "new");
        assert_eq!(shell.execute(&ctx, "lxc list").await.unwrap(), "old");
        assert_eq!(shell.count("lxc list"), 2);
        assert!(shell.execute(&ctx, "uptime").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hang_returns_on_cancel() {
        let shell = ScriptedShell::new();
        shell.on("curl", Reply::Hang);
        let ctx = OpContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = shell.execute(&ctx, "curl -o x").await.unwrap_err();
        assert!(matches!(err, ControlError::Cancelled(_)));
    }
}
