//! Pending-job table.
//!
//! Correlates asynchronous completion notifications with the waiter that
//! submitted the job. Each slot is fulfilled at most once. Completions that
//! beat their waiter's registration are buffered; completions for waits
//! abandoned after a timeout are discarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::{JobId, JobResult};

/// What happened to one completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Handed to the waiting submitter.
    Delivered,
    /// No waiter yet; kept until it registers.
    Buffered,
    /// The waiter gave up; dropped.
    Discarded,
}

#[derive(Debug, Default)]
pub struct JobTable {
    pending: HashMap<JobId, oneshot::Sender<JobResult>>,
    early: HashMap<JobId, (JobResult, Instant)>,
    abandoned: HashMap<JobId, Instant>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the completion slot for `job`.
    pub fn register(&mut self, job: JobId) -> oneshot::Receiver<JobResult> {
        let (tx, rx) = oneshot::channel();
        match self.early.remove(&job) {
            Some((result, _)) => {
                let _ = tx.send(result);
            }
            None => {
                self.pending.insert(job, tx);
            }
        }
        rx
    }

    pub fn complete(&mut self, job: JobId, result: JobResult) -> Completion {
        if let Some(tx) = self.pending.remove(&job) {
            return match tx.send(result) {
                Ok(()) => Completion::Delivered,
                Err(_) => Completion::Discarded,
            };
        }
        if self.abandoned.remove(&job).is_some() {
            return Completion::Discarded;
        }
        self.early.insert(job, (result, Instant::now()));
        Completion::Buffered
    }

    /// Give up waiting for `job`; a later completion is discarded.
    pub fn abandon(&mut self, job: JobId) {
        if self.pending.remove(&job).is_some() {
            self.abandoned.insert(job, Instant::now());
        }
    }

    /// Forget abandoned and buffered entries older than `max_age`.
    pub fn prune(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.abandoned
            .retain(|_, at| now.duration_since(*at) < max_age);
        self.early
            .retain(|_, (_, at)| now.duration_since(*at) < max_age);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }
}
