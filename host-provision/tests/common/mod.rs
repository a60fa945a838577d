// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared facilities for the host provisioning integration tests.

use host_exec::FakeExecutor;
use host_exec::Output;
use host_exec::OutputExt;
use host_provision::cloud::StaticCloudManager;
use host_provision::config::Config;
use host_provision::datastore::InMemoryDataStore;
use host_provision::events::InMemoryEventLog;
use host_provision::host::{BootstrapMethod, Distro, Host, HostId, HostStatus};
use host_provision::queue::InMemoryJobQueue;
use host_provision::{
    Collaborators, HostProvisioner, JobReport, SetupHostDriver, SetupHostJob,
};
use hostprov_test_utils::dev::{test_setup_log, LogContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
    [log]
    mode = "stderr-terminal"
    level = "info"

    [agent]
    download_url = "https://downloads.example.com/agent"
    version = "2.4.1"

    [cli]
    download_url = "https://downloads.example.com/cli"

    [api]
    api_url = "https://ci.example.com"
    ui_url = "https://ci.example.com/ui"

    [expansions]
    region = "us-east-1"
"#;

pub fn test_config() -> Config {
    toml::from_str(CONFIG).expect("test config should parse")
}

pub fn linux_host(id: &str) -> Host {
    let mut host = Host::new(
        id,
        Distro {
            id: "ubuntu2204".to_string(),
            arch: "linux_amd64".to_string(),
            user: "ubuntu".to_string(),
            bootstrap_method: BootstrapMethod::Ssh,
            setup: String::new(),
            teardown: String::new(),
            work_dir: "/data/mci".to_string(),
        },
    );
    host.status = HostStatus::Provisioning;
    host.dns_name = format!("{id}.example.com");
    host
}

/// Everything a provisioning test needs, wired to in-memory fakes.
pub struct ProvisionerTestContext {
    pub logctx: LogContext,
    pub store: Arc<InMemoryDataStore>,
    pub events: Arc<InMemoryEventLog>,
    pub cloud: Arc<StaticCloudManager>,
    pub executor: Arc<FakeExecutor>,
    pub queue: Arc<InMemoryJobQueue>,
    pub driver: SetupHostDriver,
}

impl ProvisionerTestContext {
    pub fn new(test_name: &str) -> Self {
        Self::with_config(test_name, test_config())
    }

    pub fn with_config(test_name: &str, config: Config) -> Self {
        let logctx = test_setup_log(test_name);
        let log = logctx.log.clone();
        let config = Arc::new(config);
        let store = Arc::new(InMemoryDataStore::new());
        let events = Arc::new(InMemoryEventLog::new());
        let cloud = Arc::new(StaticCloudManager::new());
        let executor = FakeExecutor::new(log.clone());
        let queue = Arc::new(InMemoryJobQueue::new());

        let provisioner = Arc::new(HostProvisioner::new(
            &log,
            config.clone(),
            Collaborators {
                hosts: store.clone(),
                credentials: store.clone(),
                users: store.clone(),
                events: events.clone(),
                cloud: cloud.clone(),
                executor: executor.clone().as_executor(),
            },
        ));
        let driver = SetupHostDriver::new(
            &log,
            provisioner,
            queue.clone(),
            &config.provisioning,
        );

        Self { logctx, store, events, cloud, executor, queue, driver }
    }

    /// Makes every command fail with `output`.
    pub fn fail_all_commands(&self, output: &'static str) {
        self.executor.set_wait_handler(Box::new(move |_input, _deadline| {
            Output::failure().set_stderr(output)
        }));
    }

    pub async fn run(&self, host_id: &HostId) -> JobReport {
        self.run_job(SetupHostJob::new(host_id.clone(), "initial")).await
    }

    pub async fn run_job(&self, job: SetupHostJob) -> JobReport {
        self.driver.run_job(job, &CancellationToken::new()).await
    }

    pub fn host(&self, host_id: &HostId) -> Host {
        self.store.host(host_id).expect("host should exist")
    }

    /// Programs run so far, in order.
    pub fn programs(&self) -> Vec<String> {
        self.executor
            .executed()
            .into_iter()
            .map(|command| command.input.program)
            .collect()
    }

    pub fn teardown(self) {
        self.logctx.cleanup_successful();
    }
}
