// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The queue that setup-host jobs are submitted to.

use crate::host::HostId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// A queued job: which host to set up, and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub host_id: HostId,
    /// Higher runs first.
    pub priority: i32,
    /// The job is not handed out before this time.
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is not accepting jobs")]
    NotStarted,
    #[error("job {0} was already submitted")]
    Duplicate(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Whether the queue currently accepts jobs.
    fn started(&self) -> bool;

    /// Submits a job.  Ids are unique for the queue's lifetime; resubmitting
    /// one fails with [`QueueError::Duplicate`] even after it has run.
    async fn put(&self, job: JobRecord) -> Result<(), QueueError>;

    /// Removes and returns every job due at `now`, highest priority first.
    async fn take_ready(&self, now: DateTime<Utc>) -> Vec<JobRecord>;

    /// Earliest time at which a pending job becomes due.
    async fn next_not_before(&self) -> Option<DateTime<Utc>>;
}

#[derive(Default)]
struct Inner {
    started: bool,
    submitted: BTreeSet<String>,
    pending: Vec<JobRecord>,
}

/// A process-local [`JobQueue`].
#[derive(Default)]
pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
}

impl InMemoryJobQueue {
    /// Returns a queue that is not yet accepting jobs.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().started = true;
    }

    /// Stops accepting jobs.  Pending jobs stay queued.
    pub fn stop(&self) {
        self.inner.lock().unwrap().started = false;
    }

    pub fn pending(&self) -> Vec<JobRecord> {
        self.inner.lock().unwrap().pending.clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn started(&self) -> bool {
        self.inner.lock().unwrap().started
    }

    async fn put(&self, job: JobRecord) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.started {
            return Err(QueueError::NotStarted);
        }
        if !inner.submitted.insert(job.id.clone()) {
            return Err(QueueError::Duplicate(job.id));
        }
        inner.pending.push(job);
        Ok(())
    }

    async fn take_ready(&self, now: DateTime<Utc>) -> Vec<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let (mut ready, waiting): (Vec<_>, Vec<_>) =
            inner.pending.drain(..).partition(|job| job.not_before <= now);
        inner.pending = waiting;
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.not_before.cmp(&b.not_before))
        });
        ready
    }

    async fn next_not_before(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|job| job.not_before)
            .min()
    }
}
