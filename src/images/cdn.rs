use crate::config::CdnConfig;
use crate::context::OpContext;
use crate::ssh::{shell_quote, RemoteShell};
use crate::{ControlError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Picks the first CDN prefix that answers its probe from a given host. Results are cached per
/// host for the life of the process, including "no CDN works".
pub struct CdnSelector {
    config: CdnConfig,
    chosen: Mutex<HashMap<String, Option<String>>>,
}

impl CdnSelector {
    pub fn new(config: CdnConfig) -> Self {
        Self {
            config,
            chosen: Mutex::new(HashMap::new()),
        }
    }

    pub fn probe_command(endpoint: &str, test_url: &str) -> String {
        format!(
            "curl -4 -sL -k --max-time 6 {} 2>/dev/null | grep -q success && echo success",
            shell_quote(&format!("{endpoint}{test_url}"))
        )
    }

    /// CDN prefix usable from `host`, probing endpoints in order on first use.
    pub async fn select(
        &self,
        ctx: &OpContext,
        shell: &dyn RemoteShell,
        host: &str,
    ) -> Result<Option<String>> {
        if self.config.endpoints.is_empty() || self.config.test_url.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.cached(host)? {
            return Ok(cached);
        }

        let mut winner = None;
        for endpoint in &self.config.endpoints {
            let cmd = Self::probe_command(endpoint, &self.config.test_url);
            match shell.execute(ctx, &cmd).await {
                Ok(out) if out.contains("success") => {
                    tracing::info!(host, cdn = %endpoint, "CDN可用");
                    winner = Some(endpoint.clone());
                    break;
                }
                Ok(_) => tracing::debug!(host, cdn = %endpoint, "CDN probe returned no marker"),
                Err(err) if err.is_interrupt() => return Err(err),
                Err(err) => tracing::debug!(host, cdn = %endpoint, error = %err, "CDN probe failed"),
            }
        }

        self.chosen
            .lock()
            .map_err(|_| ControlError::Internal("cdn cache lock poisoned".to_string()))?
            .insert(host.to_string(), winner.clone());
        Ok(winner)
    }

    fn cached(&self, host: &str) -> Result<Option<Option<String>>> {
        let chosen = self
            .chosen
            .lock()
            .map_err(|_| ControlError::Internal("cdn cache lock poisoned".to_string()))?;
        Ok(chosen.get(host).cloned())
    }
}
