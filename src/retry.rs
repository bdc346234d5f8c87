//! Deadline and retry helpers shared by the database layer and the task executors.

use crate::context::OpContext;
use crate::{ControlError, Result};
use std::future::Future;
use std::time::Duration;

const DB_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Run `fut` under a deadline derived from `ctx`.
pub async fn with_deadline<T, F>(ctx: &OpContext, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    ctx.with_timeout(timeout).run(fut).await
}

/// Synchronous retry loop with exponential backoff, used for short database transactions.
pub fn with_retries<T, C, F>(attempts: u32, classify: C, mut op: F) -> Result<T>
where
    C: Fn(&ControlError) -> bool,
    F: FnMut() -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut delay = DB_BACKOFF_BASE;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && classify(&err) => {
                tracing::debug!(attempt, error = %err, "retrying after transient failure");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Delay schedule between async attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed(Duration),
    /// `attempt * base`
    Linear(Duration),
    Exponential(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(d) => d * attempt,
            Backoff::Exponential(d) => d * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }
}

/// Async retry loop. Sleeps race the context, and interrupts are never retried.
pub async fn with_retries_async<T, C, F, Fut>(
    ctx: &OpContext,
    attempts: u32,
    backoff: Backoff,
    classify: C,
    mut op: F,
) -> Result<T>
where
    C: Fn(&ControlError) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) if attempt < attempts && classify(&err) => {
                tracing::warn!(attempt, attempts, error = %err, "attempt failed, retrying");
                ctx.sleep(backoff.delay(attempt)).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
