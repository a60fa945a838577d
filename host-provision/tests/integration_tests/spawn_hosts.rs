// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spawn hosts, which also get the command-line client.

use crate::common::{linux_host, ProvisionerTestContext};
use assert_matches::assert_matches;
use host_exec::{Deadline, Output, OutputExt};
use host_provision::client::ClientError;
use host_provision::events::HostEventKind;
use host_provision::host::{Host, HostStatus, ProvisionOptions, User};
use host_provision::{ProvisionOutcome, RetryDecision, SetupHostError};

fn spawn_host(id: &str, task_id: Option<&str>) -> Host {
    let mut host = linux_host(id);
    host.provision_options = Some(ProvisionOptions {
        owner_id: "alice".to_string(),
        task_id: task_id.map(str::to_string),
        load_cli: true,
    });
    host
}

fn alice() -> User {
    User { id: "alice".to_string(), api_key: "0123456789abcdef".to_string() }
}

#[tokio::test]
async fn test_spawn_host_gets_client_and_task_data() {
    let cx =
        ProvisionerTestContext::new("test_spawn_host_gets_client_and_task_data");
    let host = spawn_host("h-1", Some("task_42"));
    cx.store.insert_host(host.clone());
    cx.store.insert_user(alice());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);

    let executed = cx.executor.executed();
    let deadlines: Vec<_> = executed.iter().map(|c| c.deadline).collect();
    assert_eq!(
        deadlines,
        [
            Deadline::FileTransfer,
            Deadline::BinaryDownload,
            Deadline::RemoteShellSetup,
            Deadline::BinaryDownload,
            Deadline::FileTransfer,
            Deadline::RemoteSetup,
            Deadline::ArtifactFetch,
        ]
    );
    assert_eq!(
        executed[4].input.last_arg(),
        Some("ubuntu@h-1.example.com:~/cli_bin/.hostprov.yml")
    );
    assert_eq!(
        executed[6].input.last_arg(),
        Some(
            "~/cli_bin/hostprov -c ~/cli_bin/.hostprov.yml fetch -t task_42 \
             --source --artifacts --dir=/data/mci"
        )
    );
    assert!(cx.host(&host.id).provisioned);

    cx.teardown();
}

#[tokio::test]
async fn test_task_fetch_failure_is_not_fatal() {
    let cx = ProvisionerTestContext::new("test_task_fetch_failure_is_not_fatal");
    let host = spawn_host("h-1", Some("task_42"));
    cx.store.insert_host(host.clone());
    cx.store.insert_user(alice());
    cx.executor.set_wait_handler(Box::new(|input, _deadline| {
        if input.contains(" fetch -t ") {
            Output::failure().set_stderr("task not found")
        } else {
            Output::success()
        }
    }));

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(cx.executor.executed().len(), 7);
    assert_eq!(cx.host(&host.id).status, HostStatus::Provisioned);

    cx.teardown();
}

#[tokio::test]
async fn test_missing_owner_gives_up_immediately() {
    let cx =
        ProvisionerTestContext::new("test_missing_owner_gives_up_immediately");
    cx.queue.start();
    let host = spawn_host("h-1", None);
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);
    assert_eq!(report.decision, RetryDecision::None);
    assert_matches!(
        report.error,
        Some(SetupHostError::Client {
            err: ClientError::OwnerNotFound { .. },
            ..
        })
    );

    let stored = cx.host(&host.id);
    assert_eq!(stored.status, HostStatus::Unprovisioned);
    assert_eq!(stored.provision_attempts, 1);
    assert_eq!(cx.events.failures(&host.id), 1);
    assert!(cx.queue.pending().is_empty());
    // The agent went on; the client never did.
    assert_eq!(cx.programs(), ["ssh", "ssh"]);

    cx.teardown();
}

#[tokio::test]
async fn test_client_setup_failure_records_output() {
    let cx =
        ProvisionerTestContext::new("test_client_setup_failure_records_output");
    cx.queue.start();
    let host = spawn_host("h-1", Some("task_42"));
    cx.store.insert_host(host.clone());
    cx.store.insert_user(alice());
    cx.executor.set_wait_handler(Box::new(|input, _deadline| {
        if input.contains(" host setup") {
            Output::failure().set_stderr("setup exploded")
        } else {
            Output::success()
        }
    }));

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::FailedTerminal);
    assert_eq!(report.decision, RetryDecision::None);
    assert!(cx.queue.pending().is_empty());
    assert_eq!(cx.host(&host.id).status, HostStatus::Unprovisioned);
    // No task data fetch after a failed host setup.
    assert_eq!(cx.executor.executed().len(), 6);

    let failed: Vec<_> = cx
        .events
        .kinds(&host.id)
        .into_iter()
        .filter(|kind| matches!(kind, HostEventKind::ProvisionFailed { .. }))
        .collect();
    assert_eq!(
        failed,
        [HostEventKind::ProvisionFailed { logs: "setup exploded".to_string() }]
    );

    cx.teardown();
}

#[tokio::test]
async fn test_client_not_loaded_unless_requested() {
    let cx =
        ProvisionerTestContext::new("test_client_not_loaded_unless_requested");
    let mut host = spawn_host("h-1", Some("task_42"));
    if let Some(options) = host.provision_options.as_mut() {
        options.load_cli = false;
    }
    cx.store.insert_host(host.clone());

    let report = cx.run(&host.id).await;
    assert_eq!(report.outcome, ProvisionOutcome::Provisioned);
    assert_eq!(cx.executor.executed().len(), 2);

    cx.teardown();
}
