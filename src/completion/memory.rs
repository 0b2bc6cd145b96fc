use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{CompletionTracker, WaitTimeout};

/// Channels of a single job. Guarded separately so jobs never contend with each other.
#[derive(Default)]
struct JobChannels {
    channels: Mutex<HashMap<String, watch::Sender<bool>>>,
}

pub struct InMemoryCompletionTracker {
    jobs: RwLock<HashMap<String, Arc<JobChannels>>>,
}

impl InMemoryCompletionTracker {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of jobs that still have pending channels.
    pub fn active_jobs(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn job(&self, job_id: &str) -> Option<Arc<JobChannels>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).cloned()
    }

    fn subscribe(&self, job_id: &str) -> Vec<(String, watch::Receiver<bool>)> {
        let Some(job) = self.job(job_id) else {
            return Vec::new();
        };
        let channels = job.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .iter()
            .map(|(name, sender)| (name.clone(), sender.subscribe()))
            .collect()
    }

    /// Removes the job entry if its last channel is gone. Lock order is always
    /// table first, then job.
    fn collect_if_empty(&self, job_id: &str, job: &Arc<JobChannels>) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(current) = jobs.get(job_id) else {
            return;
        };
        if !Arc::ptr_eq(current, job) {
            return;
        }
        let empty = current
            .channels
            .lock()
            .map(|channels| channels.is_empty())
            .unwrap_or(false);
        if empty {
            jobs.remove(job_id);
            debug!("All channels of job {} signaled, record removed", job_id);
        }
    }
}

impl Default for InMemoryCompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_signaled(mut receiver: watch::Receiver<bool>) {
    // A dropped sender means the job was forgotten; nothing left to wait for.
    let _ = receiver.wait_for(|signaled| *signaled).await;
}

#[async_trait]
impl CompletionTracker for InMemoryCompletionTracker {
    fn register(&self, job_id: &str, names: &[String]) {
        let job = JobChannels::default();
        {
            let mut channels = job.channels.lock().unwrap_or_else(|e| e.into_inner());
            for name in names {
                let (sender, _) = watch::channel(false);
                channels.insert(name.clone(), sender);
            }
        }

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.insert(job_id.to_string(), Arc::new(job)).is_some() {
            warn!("Job {} was already tracked, previous channels replaced", job_id);
        }
        debug!("Tracking job {} with channels {:?}", job_id, names);
    }

    fn signal(&self, job_id: &str, name: &str) -> bool {
        let Some(job) = self.job(job_id) else {
            debug!("Ignoring signal {} for untracked job {}", name, job_id);
            return false;
        };

        let (sender, now_empty) = {
            let mut channels = job.channels.lock().unwrap_or_else(|e| e.into_inner());
            let sender = channels.remove(name);
            (sender, channels.is_empty())
        };

        let Some(sender) = sender else {
            debug!("Channel {} of job {} already signaled", name, job_id);
            return false;
        };
        sender.send_replace(true);
        debug!("Signaled channel {} of job {}", name, job_id);

        if now_empty {
            self.collect_if_empty(job_id, &job);
        }
        true
    }

    async fn await_all(&self, job_id: &str, wait: WaitTimeout) -> bool {
        let receivers = self.subscribe(job_id);
        if receivers.is_empty() {
            return true;
        }

        match wait {
            WaitTimeout::NoWait => receivers.iter().all(|(_, receiver)| *receiver.borrow()),
            WaitTimeout::Indefinite => {
                for (_, receiver) in receivers {
                    wait_signaled(receiver).await;
                }
                true
            }
            WaitTimeout::PerChannel(budget) => {
                for (name, receiver) in receivers {
                    if timeout(budget, wait_signaled(receiver)).await.is_err() {
                        debug!("Timed out waiting for channel {} of job {}", name, job_id);
                        return false;
                    }
                }
                true
            }
            WaitTimeout::Total(budget) => {
                let all = join_all(receivers.into_iter().map(|(_, r)| wait_signaled(r)));
                timeout(budget, all).await.is_ok()
            }
        }
    }

    fn pending(&self, job_id: &str) -> Vec<String> {
        let Some(job) = self.job(job_id) else {
            return Vec::new();
        };
        let channels = job.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn forget(&self, job_id: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.remove(job_id).is_some() {
            debug!("Forgot job {}", job_id);
        }
    }

    fn release(&self, name: &str) -> usize {
        let job_ids: Vec<String> = {
            let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
            jobs.keys().cloned().collect()
        };

        job_ids
            .iter()
            .filter(|job_id| self.signal(job_id, name))
            .count()
    }
}
