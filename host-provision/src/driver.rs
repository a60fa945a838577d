// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs queued setup-host jobs and schedules their retries.

use crate::config::ProvisioningConfig;
use crate::queue::{JobQueue, QueueError};
use crate::setup_host::{HostProvisioner, JobReport, SetupHostJob};
use chrono::{DateTime, Utc};
use display_error_chain::DisplayErrorChain;
use slog::{crit, error, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Connects a [`HostProvisioner`] to a [`JobQueue`].
///
/// Jobs for distinct hosts run in parallel, up to the configured limit.  Two
/// jobs for the same host never run at the same time.
#[derive(Clone)]
pub struct SetupHostDriver {
    log: Logger,
    provisioner: Arc<HostProvisioner>,
    queue: Arc<dyn JobQueue>,
    priority: i32,
    parallelism: usize,
}

impl SetupHostDriver {
    pub fn new(
        log: &Logger,
        provisioner: Arc<HostProvisioner>,
        queue: Arc<dyn JobQueue>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "SetupHostDriver")),
            provisioner,
            queue,
            priority: config.job_priority,
            parallelism: config.worker_parallelism.max(1),
        }
    }

    /// Queues `job` to run no earlier than `not_before`.
    pub async fn submit(
        &self,
        job: &SetupHostJob,
        not_before: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.queue.put(job.to_record(self.priority, not_before)).await
    }

    /// Runs one job and, if it asks for one, queues its follow-up.
    pub async fn run_job(
        &self,
        job: SetupHostJob,
        cancel: &CancellationToken,
    ) -> JobReport {
        let report = self.provisioner.run(job, cancel).await;
        if let Some((next, delay)) = report.follow_up() {
            self.schedule_retry(&next, delay).await;
        }
        report
    }

    async fn schedule_retry(&self, job: &SetupHostJob, delay: std::time::Duration) {
        let log = self.log.new(o!(
            "job" => job.id().to_string(),
            "host_id" => job.host_id().to_string(),
        ));
        if !self.queue.started() {
            warn!(log, "job queue is not running; not scheduling retry");
            return;
        }

        let now = Utc::now();
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self.submit(job, not_before).await {
            Ok(()) => info!(
                log,
                "scheduled provisioning retry";
                "not_before" => %not_before,
            ),
            Err(err) => crit!(
                log,
                "failed to schedule provisioning retry";
                "error" => %DisplayErrorChain::new(&err),
            ),
        }
    }

    /// Runs every job that is due at `now` and returns what each one did.
    pub async fn run_ready(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<JobReport> {
        let mut remaining: Vec<SetupHostJob> = self
            .queue
            .take_ready(now)
            .await
            .iter()
            .map(SetupHostJob::from_record)
            .collect();

        let mut reports = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let mut hosts = BTreeSet::new();
            let (wave, deferred): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|job| hosts.insert(job.host_id().clone()));
            reports.extend(self.run_wave(wave, cancel).await);
            remaining = deferred;
        }
        reports
    }

    async fn run_wave(
        &self,
        jobs: Vec<SetupHostJob>,
        cancel: &CancellationToken,
    ) -> Vec<JobReport> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();
        for job in jobs {
            let driver = self.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                // Hold onto the permit until the job finishes.
                let _permit = semaphore.acquire_owned().await;
                driver.run_job(job, &cancel).await
            });
        }

        let mut reports = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(self.log, "setup-host task failed"; "error" => %err);
                }
            }
        }
        reports
    }
}
