// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Repeated attempts, retry exhaustion and cancellation.

use crate::common::{linux_host, ProvisionerTestContext};
use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use host_exec::{Output, OutputExt};
use host_provision::datastore::StoreOp;
use host_provision::events::HostEventKind;
use host_provision::host::HostStatus;
use host_provision::queue::JobQueue;
use host_provision::{
    ProvisionOutcome, RetryDecision, SetupHostError, SetupHostJob,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_host_is_given_up_on_after_retry_limit() {
    let cx =
        ProvisionerTestContext::new("test_host_is_given_up_on_after_retry_limit");
    cx.queue.start();
    cx.fail_all_commands("Connection timed out");
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    let mut job = SetupHostJob::new(host.id.clone(), "initial");
    for attempt in 1..=16u32 {
        let report = cx.run_job(job).await;
        assert_eq!(report.attempts(), Some(attempt));

        if attempt <= 15 {
            assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
            assert_eq!(cx.host(&host.id).status, HostStatus::Provisioning);
            assert_eq!(cx.events.failures(&host.id), 0);

            let ready = cx.queue.take_ready(Utc::now() + Duration::hours(1)).await;
            assert_eq!(ready.len(), 1);
            assert_eq!(
                ready[0].id,
                format!("provisioning-setup-host.h-1.attempt-{attempt}")
            );
            job = SetupHostJob::from_record(&ready[0]);
        } else {
            assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);
            assert_eq!(report.decision, RetryDecision::None);
            break;
        }
    }

    let stored = cx.host(&host.id);
    assert_eq!(stored.status, HostStatus::Unprovisioned);
    assert_eq!(stored.provision_attempts, 16);
    assert!(cx.queue.pending().is_empty());
    assert_eq!(cx.events.failures(&host.id), 1);
    let errors = cx
        .events
        .kinds(&host.id)
        .into_iter()
        .filter(|kind| *kind == HostEventKind::ProvisionError)
        .count();
    assert_eq!(errors, 16);

    // A redelivered job finds nothing to do.
    let commands = cx.executor.executed().len();
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Skipped);
    assert_eq!(cx.executor.executed().len(), commands);
    assert_eq!(cx.events.failures(&host.id), 1);

    cx.teardown();
}

#[tokio::test]
async fn test_attempts_only_increase() {
    let cx = ProvisionerTestContext::new("test_attempts_only_increase");
    cx.fail_all_commands("broken pipe");
    let mut host = linux_host("h-1");
    host.provision_attempts = 3;
    cx.store.insert_host(host.clone());

    for expected in 4..=6 {
        let report = cx.run(&host.id).await;
        assert_eq!(report.attempts(), Some(expected));
        assert_eq!(cx.host(&host.id).provision_attempts, expected);
    }

    cx.teardown();
}

#[tokio::test]
async fn test_attempt_counted_locally_when_increment_fails() {
    let cx = ProvisionerTestContext::new(
        "test_attempt_counted_locally_when_increment_fails",
    );
    cx.fail_all_commands("broken pipe");
    cx.store.fail_on(StoreOp::IncrementAttempts);
    let mut host = linux_host("h-1");
    host.provision_attempts = 15;
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.attempts(), Some(16));
    assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);
    let stored = cx.host(&host.id);
    assert_eq!(stored.provision_attempts, 15);
    assert_eq!(stored.status, HostStatus::Unprovisioned);

    cx.teardown();
}

#[tokio::test]
async fn test_follow_ups_advance_while_increment_keeps_failing() {
    let cx = ProvisionerTestContext::new(
        "test_follow_ups_advance_while_increment_keeps_failing",
    );
    cx.queue.start();
    cx.fail_all_commands("broken pipe");
    cx.store.fail_on(StoreOp::IncrementAttempts);
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    // The stored count never moves, but every follow-up still gets a fresh
    // id and the retry limit is still reached.
    let mut job = SetupHostJob::new(host.id.clone(), "initial");
    for attempt in 1..=15u32 {
        let report = cx.run_job(job).await;
        assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
        assert_eq!(report.attempts(), Some(attempt));

        let ready = cx.queue.take_ready(Utc::now() + Duration::hours(1)).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(
            ready[0].id,
            format!("provisioning-setup-host.h-1.attempt-{attempt}")
        );
        job = SetupHostJob::from_record(&ready[0]);
    }

    let report = cx.run_job(job).await;
    assert_eq!(report.attempts(), Some(16));
    assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);

    let stored = cx.host(&host.id);
    assert_eq!(stored.provision_attempts, 0);
    assert_eq!(stored.status, HostStatus::Unprovisioned);
    assert!(cx.queue.pending().is_empty());
    assert_eq!(cx.events.failures(&host.id), 1);

    cx.teardown();
}

#[tokio::test]
async fn test_failure_to_mark_provisioned_is_retried() {
    let cx =
        ProvisionerTestContext::new("test_failure_to_mark_provisioned_is_retried");
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    cx.store.fail_on(StoreOp::MarkProvisioned);
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_matches!(
        report.error,
        Some(SetupHostError::MarkProvisioned { .. })
    );
    assert!(!cx.host(&host.id).provisioned);
    assert_eq!(cx.store.credential_count(), 0);

    cx.store.clear_failures();
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    let stored = cx.host(&host.id);
    assert!(stored.provisioned);
    assert_eq!(stored.provision_attempts, 2);

    cx.teardown();
}

#[tokio::test]
async fn test_cancellation_before_start_touches_nothing() {
    let cx = ProvisionerTestContext::new(
        "test_cancellation_before_start_touches_nothing",
    );
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = cx
        .driver
        .run_job(SetupHostJob::new(host.id.clone(), "initial"), &cancel)
        .await;
    assert_eq!(report.outcome, ProvisionOutcome::Canceled);
    assert_eq!(report.decision, RetryDecision::None);
    assert_eq!(cx.host(&host.id), host);
    assert_eq!(cx.store.write_count(), 0);

    cx.teardown();
}

#[tokio::test]
async fn test_cancellation_stops_between_steps() {
    let cx = ProvisionerTestContext::new("test_cancellation_stops_between_steps");
    cx.queue.start();
    let mut host = linux_host("h-1");
    host.distro.setup = "echo hi".to_string();
    cx.store.insert_host(host.clone());

    // Cancel while the agent is being installed; the in-flight step runs to
    // completion but nothing after it does.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    cx.executor.set_wait_handler(Box::new(move |_input, _deadline| {
        trigger.cancel();
        Output::success()
    }));

    let report = cx
        .driver
        .run_job(SetupHostJob::new(host.id.clone(), "initial"), &cancel)
        .await;
    assert_eq!(report.outcome, ProvisionOutcome::Canceled);
    assert_eq!(report.decision, RetryDecision::None);
    assert_matches!(report.error, Some(SetupHostError::Canceled { .. }));
    assert_eq!(cx.programs(), ["ssh", "ssh"]);

    let stored = cx.host(&host.id);
    assert_eq!(stored.status, HostStatus::Provisioning);
    assert_eq!(stored.provision_attempts, 1);
    assert_eq!(cx.store.credential_count(), 0);
    assert!(cx.events.kinds(&host.id).is_empty());
    assert!(cx.queue.pending().is_empty());

    cx.teardown();
}
