use super::ProviderRegistry;
use crate::context::OpContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Probe every host each `interval` until `token` fires. The first probe runs immediately.
pub fn spawn_health_scheduler(
    registry: Arc<ProviderRegistry>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ctx = OpContext::from_token(token.child_token());
            match registry.probe_all(&ctx).await {
                Ok(results) => tracing::debug!(hosts = results.len(), "节点健康检查完成"),
                Err(err) if err.is_interrupt() => break,
                Err(err) => tracing::warn!(error = %err, "节点健康检查失败"),
            }
        }
        tracing::info!("健康检查调度已停止");
    })
}
