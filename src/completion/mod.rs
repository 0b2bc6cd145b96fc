use std::time::Duration;

use async_trait::async_trait;

pub mod memory;

pub use memory::InMemoryCompletionTracker;

/// Channel signaled by the root webhook, once the remote service stops processing a job.
pub const ROOT_CHANNEL: &str = "__root__";

/// How long `await_all` may wait for a job's outstanding channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitTimeout {
    /// Wait until every channel is signaled.
    Indefinite,
    /// Report completion without waiting.
    NoWait,
    /// Apply the budget to each remaining channel in turn, so the worst case is
    /// the budget times the number of channels.
    PerChannel(Duration),
    /// One deadline shared by all of the job's channels.
    Total(Duration),
}

impl WaitTimeout {
    /// Maps a numeric timeout in seconds: `0` waits indefinitely, negative
    /// values never wait, positive values are a per-channel budget. Budgets
    /// too large for a `Duration`, infinity included, wait indefinitely.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs == 0.0 || secs.is_nan() {
            WaitTimeout::Indefinite
        } else if secs < 0.0 {
            WaitTimeout::NoWait
        } else {
            match Duration::try_from_secs_f64(secs) {
                Ok(budget) => WaitTimeout::PerChannel(budget),
                Err(_) => WaitTimeout::Indefinite,
            }
        }
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        Self::Indefinite
    }
}

/// Per-job table of one-shot completion channels.
#[async_trait]
pub trait CompletionTracker: Send + Sync + 'static {
    /// Creates one pending channel per name, replacing any previous record for the job.
    fn register(&self, job_id: &str, names: &[String]);

    /// Marks a channel signaled and wakes its waiters. Returns `false` when the
    /// channel was unknown or already signaled.
    fn signal(&self, job_id: &str, name: &str) -> bool;

    /// Resolves to `true` once every channel registered for the job is
    /// signaled, or `false` when the timeout elapses first.
    async fn await_all(&self, job_id: &str, timeout: WaitTimeout) -> bool;

    /// Names of the job's channels that are still pending.
    fn pending(&self, job_id: &str) -> Vec<String>;

    /// Drops the job's record without signaling, e.g. when its submission failed.
    fn forget(&self, job_id: &str);

    /// Signals the named channel for every job that still waits on it. Returns
    /// the number of channels released.
    fn release(&self, name: &str) -> usize;
}
