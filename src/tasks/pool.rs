use super::TaskManager;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// FIFO queue drained by a fixed set of workers, one pool per host. A worker picks the next
/// task id only after finishing its current task, so at most `size` tasks run on the host.
pub(super) struct HostPool {
    sender: mpsc::UnboundedSender<i64>,
    workers: Vec<JoinHandle<()>>,
}

impl HostPool {
    pub(super) fn spawn(
        manager: TaskManager,
        host_id: i64,
        size: usize,
        accepting: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<i64>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.max(1))
            .map(|worker| {
                let manager = manager.clone();
                let receiver = receiver.clone();
                let accepting = accepting.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = receiver.lock().await;
                            tokio::select! {
                                biased;
                                _ = accepting.cancelled() => None,
                                id = rx.recv() => id,
                            }
                        };
                        let Some(task_id) = next else { break };
                        manager.execute(task_id).await;
                    }
                    tracing::debug!(host_id, worker, "任务工作协程退出");
                })
            })
            .collect();
        Self { sender, workers }
    }

    /// Queue a task id. Fails only when every worker has exited.
    pub(super) fn push(&self, task_id: i64) -> bool {
        self.sender.send(task_id).is_ok()
    }

    pub(super) fn size(&self) -> usize {
        self.workers.len()
    }

    pub(super) fn into_workers(self) -> Vec<JoinHandle<()>> {
        self.workers
    }
}
