// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single provisioning runs against one host.

use crate::common::{linux_host, ProvisionerTestContext};
use assert_matches::assert_matches;
use host_exec::{Deadline, Output, OutputExt};
use host_provision::events::HostEventKind;
use host_provision::host::{BootstrapMethod, HostStatus};
use host_provision::{ProvisionOutcome, RetryDecision, SetupHostError};
use std::time::Duration;

#[tokio::test]
async fn test_ssh_host_is_provisioned() {
    let cx = ProvisionerTestContext::new("test_ssh_host_is_provisioned");
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(report.decision, RetryDecision::None);
    assert!(report.error.is_none());

    let stored = cx.host(&host.id);
    assert_eq!(stored.status, HostStatus::Provisioned);
    assert!(stored.provisioned);
    assert!(stored.provision_time.is_some());
    assert_eq!(stored.provision_attempts, 1);
    assert_eq!(cx.store.credential_count(), 1);
    assert_eq!(cx.events.kinds(&host.id), [HostEventKind::Provisioned]);
    assert_eq!(cx.cloud.on_up_calls(), [host.id.clone()]);

    let deadlines: Vec<_> =
        cx.executor.executed().iter().map(|c| c.deadline).collect();
    assert_eq!(deadlines, [Deadline::FileTransfer, Deadline::BinaryDownload]);
    assert!(cx.queue.pending().is_empty());

    cx.teardown();
}

#[tokio::test]
async fn test_user_data_host_is_left_not_running() {
    let cx = ProvisionerTestContext::new("test_user_data_host_is_left_not_running");
    let mut host = linux_host("h-1");
    host.distro.bootstrap_method = BootstrapMethod::UserData;
    host.distro.setup = "echo hi".to_string();
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::UserDataPending);

    let stored = cx.host(&host.id);
    assert_eq!(stored.status, HostStatus::ProvisionedNotRunning);
    assert!(!stored.provisioned);
    assert!(stored.last_communicated.is_some());
    assert!(cx.executor.executed().is_empty());
    assert_eq!(cx.store.credential_count(), 0);
    assert!(cx.events.kinds(&host.id).is_empty());

    cx.teardown();
}

#[tokio::test]
async fn test_task_spawned_host_gets_no_scripts() {
    let cx = ProvisionerTestContext::new("test_task_spawned_host_gets_no_scripts");
    let mut host = linux_host("h-1");
    host.spawn_options.spawned_by_task = true;
    host.distro.setup = "echo hi".to_string();
    host.distro.teardown = "echo bye".to_string();
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(cx.programs(), ["ssh", "ssh"]);

    cx.teardown();
}

#[tokio::test]
async fn test_distro_scripts_are_copied_after_agent() {
    let cx =
        ProvisionerTestContext::new("test_distro_scripts_are_copied_after_agent");
    let mut host = linux_host("h-1");
    host.distro.setup = "aws configure set region ${region}".to_string();
    host.distro.teardown = "echo bye".to_string();
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);

    let executed = cx.executor.executed();
    assert_eq!(cx.programs(), ["ssh", "ssh", "scp", "scp"]);
    assert!(executed[1].input.contains("force-reinstall"));
    assert_eq!(
        executed[2].input.last_arg(),
        Some("ubuntu@h-1.example.com:~/setup.sh")
    );
    assert_eq!(
        executed[3].input.last_arg(),
        Some("ubuntu@h-1.example.com:~/teardown.sh")
    );

    cx.teardown();
}

#[tokio::test]
async fn test_undefined_expansion_fails_the_attempt() {
    let cx =
        ProvisionerTestContext::new("test_undefined_expansion_fails_the_attempt");
    let mut host = linux_host("h-1");
    host.distro.setup = "echo ${no_such_value}".to_string();
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_matches!(
        report.error,
        Some(SetupHostError::Script { name: "setup.sh", .. })
    );
    assert_eq!(cx.programs(), ["ssh", "ssh"]);
    // Credentials from the failed attempt are dropped.
    assert_eq!(cx.store.credential_count(), 0);
    assert_eq!(cx.host(&host.id).status, HostStatus::Provisioning);

    cx.teardown();
}

#[tokio::test]
async fn test_settled_hosts_are_skipped_without_side_effects() {
    let cx = ProvisionerTestContext::new(
        "test_settled_hosts_are_skipped_without_side_effects",
    );
    let mut running = linux_host("running");
    running.status = HostStatus::Running;
    let mut provisioned = linux_host("provisioned");
    provisioned.provisioned = true;
    let mut unprovisioned = linux_host("unprovisioned");
    unprovisioned.status = HostStatus::Unprovisioned;

    for host in [running, provisioned, unprovisioned] {
        cx.store.insert_host(host.clone());
        let report = cx.run(&host.id).await;
        assert_eq!(report.outcome, ProvisionOutcome::Skipped);
        assert_eq!(report.decision, RetryDecision::None);
        assert_eq!(cx.host(&host.id), host);
    }

    assert!(cx.executor.executed().is_empty());
    assert_eq!(cx.store.write_count(), 0);
    assert!(cx.events.events().is_empty());
    assert!(cx.cloud.on_up_calls().is_empty());

    cx.teardown();
}

#[tokio::test]
async fn test_missing_host_is_terminal() {
    let cx = ProvisionerTestContext::new("test_missing_host_is_terminal");
    cx.queue.start();

    let report = cx.run(&"gone".into()).await;
    assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);
    assert_eq!(report.decision, RetryDecision::None);
    assert_matches!(report.error, Some(SetupHostError::HostNotFound { .. }));
    assert!(report.host.is_none());
    assert!(cx.queue.pending().is_empty());
    assert!(cx.executor.executed().is_empty());

    cx.teardown();
}

#[tokio::test]
async fn test_dns_name_is_resolved_and_saved() {
    let cx = ProvisionerTestContext::new("test_dns_name_is_resolved_and_saved");
    let mut host = linux_host("h-1");
    host.dns_name = String::new();
    cx.store.insert_host(host.clone());
    cx.cloud.set_dns_name(&host.id, "ec2-1-2-3-4.compute.example.com");

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(cx.host(&host.id).dns_name, "ec2-1-2-3-4.compute.example.com");
    for command in cx.executor.executed() {
        assert!(command
            .input
            .contains("ubuntu@ec2-1-2-3-4.compute.example.com"));
    }

    cx.teardown();
}

#[tokio::test]
async fn test_host_without_address_is_retried() {
    let cx = ProvisionerTestContext::new("test_host_without_address_is_retried");
    let mut host = linux_host("h-1");
    host.dns_name = String::new();
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_eq!(
        report.decision,
        RetryDecision::RetryAfter(Duration::from_secs(60))
    );
    assert_matches!(report.error, Some(SetupHostError::NoAddress { .. }));
    assert!(cx.executor.executed().is_empty());
    assert!(cx.cloud.on_up_calls().is_empty());
    assert_eq!(cx.events.kinds(&host.id), [HostEventKind::ProvisionError]);

    cx.teardown();
}

#[tokio::test]
async fn test_cloud_failures_are_retried() {
    let cx = ProvisionerTestContext::new("test_cloud_failures_are_retried");
    let mut host = linux_host("h-1");
    host.dns_name = String::new();
    cx.store.insert_host(host.clone());

    cx.cloud.fail_dns(Some("rate limited"));
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_matches!(report.error, Some(SetupHostError::Dns { .. }));

    cx.cloud.fail_dns(None);
    cx.cloud.set_dns_name(&host.id, "h-1.example.com");
    cx.cloud.fail_on_up(Some("tagging failed"));
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_matches!(report.error, Some(SetupHostError::OnUp { .. }));
    assert!(cx.executor.executed().is_empty());

    let stored = cx.host(&host.id);
    assert_eq!(stored.provision_attempts, 2);
    assert_eq!(stored.status, HostStatus::Provisioning);

    cx.teardown();
}

#[tokio::test]
async fn test_failed_credential_write_stores_nothing() {
    let cx =
        ProvisionerTestContext::new("test_failed_credential_write_stores_nothing");
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    cx.executor.set_wait_handler(Box::new(|input, _deadline| {
        if input.contains("base64 --decode") {
            Output::failure().set_stderr("Permission denied (publickey)")
        } else {
            Output::success()
        }
    }));
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_matches!(report.error, Some(SetupHostError::Agent { .. }));
    assert_eq!(cx.store.credential_count(), 0);
    assert_eq!(cx.executor.executed().len(), 1);

    cx.executor
        .set_wait_handler(Box::new(|_input, _deadline| Output::success()));
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(cx.store.credential_count(), 1);
    assert!(cx.store.credentials(&host.id).is_some());

    cx.teardown();
}

#[tokio::test]
async fn test_failed_install_discards_issued_credentials() {
    let cx = ProvisionerTestContext::new(
        "test_failed_install_discards_issued_credentials",
    );
    let host = linux_host("h-1");
    cx.store.insert_host(host.clone());

    cx.executor.set_wait_handler(Box::new(|input, _deadline| {
        if input.contains("force-reinstall") {
            Output::failure().set_stdout("curl: (6) Could not resolve host")
        } else {
            Output::success()
        }
    }));
    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::RetryScheduled);
    assert_eq!(cx.executor.executed().len(), 2);
    assert_eq!(cx.store.credential_count(), 0);

    cx.teardown();
}
