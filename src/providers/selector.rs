use crate::models::ExecutionRule;
use crate::{ControlError, Result};
use std::future::Future;

/// Chooses between the hypervisor API and SSH for one host, per its execution rule.
#[derive(Debug, Clone)]
pub struct Selector {
    host: String,
    rule: ExecutionRule,
    api_available: bool,
}

impl Selector {
    pub fn new(host: impl Into<String>, rule: ExecutionRule, api_available: bool) -> Self {
        Self {
            host: host.into(),
            rule,
            api_available,
        }
    }

    pub fn rule(&self) -> ExecutionRule {
        self.rule
    }

    /// Whether the API path would be attempted at all.
    pub fn uses_api(&self) -> bool {
        self.api_available && self.rule != ExecutionRule::SshOnly
    }

    /// Fail early when no permitted path exists, before any side effect.
    pub fn require_path(&self, op: &str) -> Result<()> {
        if self.rule == ExecutionRule::ApiOnly && !self.api_available {
            return Err(ControlError::HostUnavailable(format!(
                "{op}: execution rule api_only requires an API path on host {}",
                self.host
            )));
        }
        Ok(())
    }

    /// Run `op` through the configured path. `api` is `None` when the operation has no API
    /// implementation. Futures are lazy, so the unused path never runs.
    pub async fn run<T, A, S>(&self, op: &str, api: Option<A>, ssh: S) -> Result<T>
    where
        A: Future<Output = Result<T>>,
        S: Future<Output = Result<T>>,
    {
        match self.rule {
            ExecutionRule::SshOnly => {
                tracing::info!(host = %self.host, operation = op, "执行规则ssh_only，使用SSH执行");
                ssh.await
            }
            ExecutionRule::ApiOnly => match api {
                Some(api) if self.api_available => {
                    tracing::info!(host = %self.host, operation = op, "执行规则api_only，使用API执行");
                    api.await
                }
                _ => Err(ControlError::HostUnavailable(format!(
                    "{op}: execution rule api_only requires an API path on host {}",
                    self.host
                ))),
            },
            ExecutionRule::Auto => match api {
                Some(api) if self.api_available => {
                    tracing::info!(host = %self.host, operation = op, "使用API执行");
                    match api.await {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_interrupt() => Err(err),
                        Err(err) => {
                            tracing::warn!(
                                host = %self.host,
                                error = %err,
                                "回退到SSH执行 - {}",
                                op
                            );
                            ssh.await
                        }
                    }
                }
                _ => {
                    tracing::info!(host = %self.host, operation = op, "使用SSH执行");
                    ssh.await
                }
            },
        }
    }
}
