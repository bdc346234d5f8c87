pub mod format;
pub mod hosts;
pub mod instances;
pub mod tasks;
pub mod users;

use anyhow::{Context, Result};
use fleet_control::ControlService;
use tokio_util::sync::CancellationToken;

/// Run the background loops until Ctrl+C.
pub async fn serve(service: &ControlService) -> Result<()> {
    tracing::info!("启动控制面服务");
    let token = CancellationToken::new();
    let handles = service
        .start_background(token.clone())
        .context("Failed to start background workers")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("收到退出信号，正在停止");

    token.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "后台任务异常退出");
        }
    }
    Ok(())
}
