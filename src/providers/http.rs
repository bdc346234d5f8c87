//! HTTPS plumbing shared by the API-capable adapters.

use crate::context::OpContext;
use crate::models::host::endpoint_host;
use crate::{ControlError, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// `https://host:port` for an endpoint, using `default_port` when none is given.
pub(crate) fn base_url(endpoint: &str, default_port: u16) -> String {
    let host = endpoint_host(endpoint);
    let trimmed = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let port = if let Some(rest) = trimmed.strip_prefix('[') {
        rest.split_once("]:").and_then(|(_, p)| p.parse().ok())
    } else if trimmed.matches(':').count() == 1 {
        trimmed.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    } else {
        None
    }
    .unwrap_or(default_port);

    if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// Send a request, aborting it when the context finishes. Non-2xx responses become hypervisor
/// errors carrying the response body.
pub(crate) async fn send(
    ctx: &OpContext,
    op: &str,
    req: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let resp = ctx.run(async { Ok(req.send().await?) }).await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = ctx.run(async { Ok(resp.text().await.unwrap_or_default()) }).await?;
    Err(ControlError::hypervisor(
        format!("{op}: API returned {status}"),
        body,
    ))
}

/// Whether an API error was a 404.
pub(crate) fn is_not_found(err: &ControlError) -> bool {
    matches!(err, ControlError::Hypervisor { message, .. } if message.contains("API returned 404"))
}

pub(crate) async fn send_json<T: DeserializeOwned>(
    ctx: &OpContext,
    op: &str,
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let resp = send(ctx, op, req).await?;
    let text = ctx.run(async { Ok(resp.text().await?) }).await?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.1", 8443), "https://10.0.0.1:8443");
        assert_eq!(base_url("10.0.0.1:9443", 8443), "https://10.0.0.1:9443");
        assert_eq!(base_url("2001:db8::5", 8006), "https://[2001:db8::5]:8006");
        assert_eq!(base_url("[2001:db8::5]:18006", 8006), "https://[2001:db8::5]:18006");
        assert_eq!(base_url("pve.example.com", 8006), "https://pve.example.com:8006");
    }
}
