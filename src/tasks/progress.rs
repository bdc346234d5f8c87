use crate::providers::ProgressFn;
use crate::state::{tasks, StateDatabase};
use std::sync::Arc;

/// Writes progress for one task. Failures are logged and never abort the task.
#[derive(Clone)]
pub struct Progress {
    db: StateDatabase,
    task_id: i64,
}

impl Progress {
    pub fn new(db: StateDatabase, task_id: i64) -> Self {
        Self { db, task_id }
    }

    pub fn report(&self, percent: u8, message: &str) {
        if let Err(err) = self
            .db
            .write(|tx| tasks::update_progress(tx, self.task_id, percent, message))
        {
            tracing::warn!(task_id = self.task_id, error = %err, "更新任务进度失败");
        }
    }

    /// Adapter callback that maps the adapter's `0..=100` onto `from..=to` of the task.
    pub fn window(&self, from: u8, to: u8) -> ProgressFn {
        let progress = self.clone();
        let span = u32::from(to.saturating_sub(from));
        Arc::new(move |percent, message| {
            let scaled = from as u32 + span * u32::from(percent.min(100)) / 100;
            progress.report(scaled as u8, message);
        })
    }
}
