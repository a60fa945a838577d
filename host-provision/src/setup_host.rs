// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The setup-host job: one provisioning attempt against one host.
//!
//! A run loads the host, skips it if there is nothing left to do, bumps its
//! attempt count and then walks it through DNS resolution, the cloud on-up
//! callback, agent installation, distro scripts and (for spawn hosts) the
//! command-line client.  Failures are classified into a [`RetryDecision`];
//! acting on that decision is left to the caller (see
//! [`crate::driver::SetupHostDriver`]).

use crate::agent::{AgentError, AgentInstaller, InstallOutcome};
use crate::client::{ClientDeployer, ClientError};
use crate::cloud::{CloudError, CloudManager};
use crate::config::{Config, ProvisioningConfig};
use crate::credentials::CredentialProvisioner;
use crate::datastore::{CredentialStore, HostStore, StoreError, UserStore};
use crate::events::{EventLog, HostEvent, HostEventKind};
use crate::host::{
    BootstrapMethod, Host, HostId, HostStatus, ProvisionOptions, SshInfoError,
};
use crate::queue::JobRecord;
use crate::script::{ScriptDeployer, ScriptError};
use chrono::{DateTime, Utc};
use display_error_chain::DisplayErrorChain;
use host_exec::BoxedExecutor;
use slog::{crit, error, info, o, Logger};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const SETUP_HOST_JOB_NAME: &str = "provisioning-setup-host";

const SETUP_SCRIPT_NAME: &str = "setup.sh";
const POWERSHELL_SETUP_SCRIPT_NAME: &str = "setup.ps1";
const TEARDOWN_SCRIPT_NAME: &str = "teardown.sh";

/// Job ids are `<job name>.<host id>.<tag>`, so that the queue can drop
/// duplicate submissions of the same attempt.
pub fn setup_host_job_id(host_id: &HostId, tag: &str) -> String {
    format!("{SETUP_HOST_JOB_NAME}.{host_id}.{tag}")
}

/// Tag of the job that follows a failed attempt.
pub fn attempt_tag(attempts: u32) -> String {
    format!("attempt-{attempts}")
}

#[derive(Clone, Debug)]
pub struct SetupHostJob {
    id: String,
    host_id: HostId,
    host: Option<Host>,
}

impl SetupHostJob {
    pub fn new(host_id: HostId, tag: &str) -> Self {
        Self { id: setup_host_job_id(&host_id, tag), host_id, host: None }
    }

    /// A job that starts from an already loaded host record.
    pub fn for_host(host: Host, tag: &str) -> Self {
        Self {
            id: setup_host_job_id(&host.id, tag),
            host_id: host.id.clone(),
            host: Some(host),
        }
    }

    pub fn from_record(record: &JobRecord) -> Self {
        Self { id: record.id.clone(), host_id: record.host_id.clone(), host: None }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    /// The attempt count this job was scheduled after, for follow-up jobs.
    pub fn attempt(&self) -> Option<u32> {
        let (_, tag) = self.id.rsplit_once('.')?;
        tag.strip_prefix("attempt-")?.parse().ok()
    }

    pub fn to_record(
        &self,
        priority: i32,
        not_before: DateTime<Utc>,
    ) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            priority,
            not_before,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Nothing to do: the host was already set up or given up on.
    Skipped,
    Provisioned,
    /// Our part is done; the host finishes bootstrapping from user data.
    UserDataPending,
    /// This attempt failed and another one should follow.
    RetryScheduled,
    /// Provisioning failed for good.
    FailedTerminal,
    /// The run stopped early because it was asked to.
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    None,
    RetryAfter(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Highest attempt count at which a failure is still retried.
    pub limit: u32,
    pub delay: Duration,
}

impl From<&ProvisioningConfig> for RetryPolicy {
    fn from(config: &ProvisioningConfig) -> Self {
        Self { limit: config.retry_limit, delay: config.retry_delay }
    }
}

/// Hosts get a bounded number of attempts, and only while nothing else has
/// moved them out of provisioning.
pub fn should_retry_provisioning(host: &Host, limit: u32) -> bool {
    host.provision_attempts <= limit
        && host.status == HostStatus::Provisioning
        && !host.provisioned
}

/// Decides whether a run that ended with an error of kind `error` (or none)
/// should be followed by another attempt.
pub fn retry_decision(
    host: &Host,
    error: Option<ErrorKind>,
    policy: &RetryPolicy,
) -> RetryDecision {
    match error {
        Some(ErrorKind::Transient)
            if should_retry_provisioning(host, policy.limit) =>
        {
            RetryDecision::RetryAfter(policy.delay)
        }
        _ => RetryDecision::None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// May succeed on a later attempt.
    Transient,
    /// Cannot succeed without someone changing the host or its owner.
    Configuration,
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupHostError {
    #[error("could not find host {host_id} for job {job_id}")]
    HostNotFound { host_id: HostId, job_id: String },
    #[error("failed to load host {host_id}")]
    Load {
        host_id: HostId,
        #[source]
        err: StoreError,
    },
    #[error("setup canceled for host {host_id} before {step}")]
    Canceled { host_id: HostId, step: &'static str },
    #[error("error checking DNS name for host {host_id}")]
    Dns {
        host_id: HostId,
        #[source]
        err: CloudError,
    },
    #[error(
        "instance {host_id} is running but not returning a DNS name or IP \
         address"
    )]
    NoAddress { host_id: HostId },
    #[error("error setting DNS name for host {host_id}")]
    SetDns {
        host_id: HostId,
        #[source]
        err: StoreError,
    },
    #[error("on-up callback failed for host {host_id}")]
    OnUp {
        host_id: HostId,
        #[source]
        err: CloudError,
    },
    #[error("error putting agent on host {host_id}")]
    Agent {
        host_id: HostId,
        #[source]
        err: AgentError,
    },
    #[error(transparent)]
    SshInfo(#[from] SshInfoError),
    #[error("error copying {name} to host {host_id}")]
    Script {
        host_id: HostId,
        name: &'static str,
        #[source]
        err: ScriptError,
    },
    #[error("failed to set up client on host {host_id}")]
    Client {
        host_id: HostId,
        #[source]
        err: ClientError,
    },
    #[error("error marking host {host_id} as provisioned")]
    MarkProvisioned {
        host_id: HostId,
        #[source]
        err: StoreError,
    },
}

impl SetupHostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SetupHostError::Canceled { .. } => ErrorKind::Canceled,
            SetupHostError::HostNotFound { .. } => ErrorKind::Configuration,
            SetupHostError::Client { err, .. } if err.is_configuration() => {
                ErrorKind::Configuration
            }
            _ => ErrorKind::Transient,
        }
    }
}

/// What one run did.
#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub host_id: HostId,
    pub outcome: ProvisionOutcome,
    pub decision: RetryDecision,
    /// The host as the run left it, if it could be loaded.
    pub host: Option<Host>,
    pub error: Option<SetupHostError>,
}

impl JobReport {
    fn without_host(
        job_id: String,
        host_id: HostId,
        error: SetupHostError,
    ) -> Self {
        Self {
            job_id,
            host_id,
            outcome: ProvisionOutcome::FailedTerminal,
            decision: RetryDecision::None,
            host: None,
            error: Some(error),
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        self.host.as_ref().map(|host| host.provision_attempts)
    }

    /// The job to run next, and how long to wait before running it.
    pub fn follow_up(&self) -> Option<(SetupHostJob, Duration)> {
        match (self.decision, &self.host) {
            (RetryDecision::RetryAfter(delay), Some(host)) => Some((
                SetupHostJob::new(
                    host.id.clone(),
                    &attempt_tag(host.provision_attempts),
                ),
                delay,
            )),
            _ => None,
        }
    }
}

/// External systems a [`HostProvisioner`] works against.
#[derive(Clone)]
pub struct Collaborators {
    pub hosts: Arc<dyn HostStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub users: Arc<dyn UserStore>,
    pub events: Arc<dyn EventLog>,
    pub cloud: Arc<dyn CloudManager>,
    pub executor: BoxedExecutor,
}

/// Runs setup-host jobs.
pub struct HostProvisioner {
    log: Logger,
    config: Arc<Config>,
    policy: RetryPolicy,
    hosts: Arc<dyn HostStore>,
    events: Arc<dyn EventLog>,
    cloud: Arc<dyn CloudManager>,
    credentials: Arc<CredentialProvisioner>,
    scripts: Arc<ScriptDeployer>,
    agent: AgentInstaller,
    client: ClientDeployer,
}

impl HostProvisioner {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        collaborators: Collaborators,
    ) -> Self {
        let log = log.new(o!("component" => "HostProvisioner"));
        let Collaborators {
            hosts,
            credentials,
            users,
            events,
            cloud,
            executor,
        } = collaborators;

        let credentials = Arc::new(CredentialProvisioner::new(
            &log,
            config.clone(),
            executor.clone(),
            credentials,
        ));
        let scripts =
            Arc::new(ScriptDeployer::new(&log, config.clone(), executor.clone()));
        let agent = AgentInstaller::new(
            &log,
            config.clone(),
            executor.clone(),
            hosts.clone(),
            credentials.clone(),
            scripts.clone(),
        );
        let client =
            ClientDeployer::new(&log, config.clone(), executor, users);

        Self {
            policy: RetryPolicy::from(&config.provisioning),
            log,
            config,
            hosts,
            events,
            cloud,
            credentials,
            scripts,
            agent,
            client,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Makes one provisioning attempt for the job's host.
    ///
    /// Never returns an error: failures are reported in the [`JobReport`],
    /// along with whether another attempt should follow.
    pub async fn run(
        &self,
        job: SetupHostJob,
        cancel: &CancellationToken,
    ) -> JobReport {
        let job_attempt = job.attempt();
        let SetupHostJob { id: job_id, host_id, host } = job;
        let log = self.log.new(o!(
            "job" => job_id.clone(),
            "host_id" => host_id.to_string(),
        ));

        let mut host = match host {
            Some(host) => host,
            None => match self.hosts.find_host(&host_id).await {
                Ok(Some(host)) => host,
                Ok(None) => {
                    let err = SetupHostError::HostNotFound {
                        host_id: host_id.clone(),
                        job_id: job_id.clone(),
                    };
                    error!(log, "{}", err);
                    return JobReport::without_host(job_id, host_id, err);
                }
                Err(err) => {
                    let err = SetupHostError::Load {
                        host_id: host_id.clone(),
                        err,
                    };
                    error!(log, "{}", DisplayErrorChain::new(&err));
                    return JobReport::without_host(job_id, host_id, err);
                }
            },
        };
        let log = log.new(o!("distro" => host.distro.id.clone()));

        let skipped = |host: Host, outcome| JobReport {
            job_id: job_id.clone(),
            host_id: host_id.clone(),
            outcome,
            decision: RetryDecision::None,
            host: Some(host),
            error: None,
        };

        if host.provisioned || host.status.is_settled() {
            info!(
                log,
                "skipping setup because host is already set up";
                "status" => %host.status,
                "provisioned" => host.provisioned,
            );
            return skipped(host, ProvisionOutcome::Skipped);
        }
        if cancel.is_cancelled() {
            info!(log, "setup canceled before starting");
            return skipped(host, ProvisionOutcome::Canceled);
        }

        info!(
            log,
            "attempting to setup host";
            "dns_name" => &host.dns_name,
            "bootstrap_method" => %host.bootstrap_method(),
        );
        self.increment_attempts(&log, &mut host, job_attempt).await;

        let started = Instant::now();
        let (outcome, error) = match self.provision(&log, &mut host, cancel).await
        {
            Ok(outcome) => {
                info!(
                    log,
                    "finished provisioning host";
                    "outcome" => ?outcome,
                    "attempts" => host.provision_attempts,
                    "runtime_secs" => started.elapsed().as_secs_f64(),
                );
                (outcome, None)
            }
            Err(err) => {
                let outcome = self.handle_failure(&log, &mut host, &err).await;
                (outcome, Some(err))
            }
        };

        let decision = retry_decision(
            &host,
            error.as_ref().map(SetupHostError::kind),
            &self.policy,
        );
        if let RetryDecision::RetryAfter(delay) = decision {
            info!(
                log,
                "retrying provisioning";
                "attempts" => host.provision_attempts,
                "delay_secs" => delay.as_secs(),
            );
        }

        JobReport {
            job_id,
            host_id,
            outcome,
            decision,
            host: Some(host),
            error,
        }
    }

    /// Counts this attempt.  The local count never falls behind the attempt
    /// that scheduled this job, even when the stored count lags because
    /// earlier increments failed; follow-up ids and the retry limit both
    /// depend on it.
    async fn increment_attempts(
        &self,
        log: &Logger,
        host: &mut Host,
        job_attempt: Option<u32>,
    ) {
        let counted =
            match self.hosts.increment_provision_attempts(&host.id).await {
                Ok(attempts) => attempts,
                Err(err) => {
                    let counted = host.provision_attempts + 1;
                    crit!(
                        log,
                        "increment provisioning attempts failed";
                        "attempt_value" => counted,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    counted
                }
            };
        host.provision_attempts =
            counted.max(job_attempt.map_or(0, |attempt| attempt + 1));
    }

    fn check_canceled(
        cancel: &CancellationToken,
        host: &Host,
        step: &'static str,
    ) -> Result<(), SetupHostError> {
        if cancel.is_cancelled() {
            return Err(SetupHostError::Canceled {
                host_id: host.id.clone(),
                step,
            });
        }
        Ok(())
    }

    async fn provision(
        &self,
        log: &Logger,
        host: &mut Host,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, SetupHostError> {
        let installed = self.bootstrap(log, host, cancel).await?;
        if installed == InstallOutcome::AwaitingUserData {
            return Ok(ProvisionOutcome::UserDataPending);
        }

        if let Some(options) = host.client_options().cloned() {
            self.setup_spawn_host(log, host, &options, cancel).await?;
        }

        Self::check_canceled(cancel, host, "marking host provisioned")?;
        let now = Utc::now();
        self.hosts.mark_as_provisioned(&host.id, now).await.map_err(|err| {
            SetupHostError::MarkProvisioned { host_id: host.id.clone(), err }
        })?;
        host.status = HostStatus::Provisioned;
        host.provisioned = true;
        host.provision_time = Some(now);
        self.events.record(HostEvent::now(&host.id, HostEventKind::Provisioned));

        info!(
            log,
            "host successfully provisioned";
            "provider" => &host.provider,
            "attempts" => host.provision_attempts,
            "provision_duration_secs" =>
                (now - host.creation_time).num_seconds(),
        );
        Ok(ProvisionOutcome::Provisioned)
    }

    /// DNS, on-up, the agent and distro scripts, strictly in that order.
    async fn bootstrap(
        &self,
        log: &Logger,
        host: &mut Host,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, SetupHostError> {
        Self::check_canceled(cancel, host, "resolving DNS")?;
        self.resolve_dns_name(host).await?;

        Self::check_canceled(cancel, host, "running on-up callback")?;
        self.cloud.on_up(host).await.map_err(|err| SetupHostError::OnUp {
            host_id: host.id.clone(),
            err,
        })?;

        Self::check_canceled(cancel, host, "installing agent")?;
        let installed = self.agent.install(host).await.map_err(|err| {
            error!(
                log,
                "could not set up agent";
                "error" => %DisplayErrorChain::new(&err),
            );
            SetupHostError::Agent { host_id: host.id.clone(), err }
        })?;
        if installed != InstallOutcome::Installed {
            return Ok(installed);
        }

        // Task-spawned hosts never get distro scripts.
        if !host.spawn_options.spawned_by_task {
            self.copy_distro_scripts(host, cancel).await?;
        }
        Ok(installed)
    }

    async fn resolve_dns_name(
        &self,
        host: &mut Host,
    ) -> Result<(), SetupHostError> {
        if !host.dns_name.is_empty() {
            return Ok(());
        }
        let dns_name = self.cloud.dns_name(host).await.map_err(|err| {
            SetupHostError::Dns { host_id: host.id.clone(), err }
        })?;
        if dns_name.is_empty() {
            if !host.ip.is_empty() {
                return Ok(());
            }
            return Err(SetupHostError::NoAddress { host_id: host.id.clone() });
        }
        self.hosts.set_dns_name(&host.id, &dns_name).await.map_err(|err| {
            SetupHostError::SetDns { host_id: host.id.clone(), err }
        })?;
        host.dns_name = dns_name;
        Ok(())
    }

    async fn copy_distro_scripts(
        &self,
        host: &Host,
        cancel: &CancellationToken,
    ) -> Result<(), SetupHostError> {
        let distro = &host.distro;
        if distro.setup.is_empty() && distro.teardown.is_empty() {
            return Ok(());
        }
        let target = host.ssh_target(self.config.ssh.default_port)?;

        if !distro.setup.is_empty() {
            let name = if distro.is_powershell_setup() {
                POWERSHELL_SETUP_SCRIPT_NAME
            } else {
                SETUP_SCRIPT_NAME
            };
            Self::check_canceled(cancel, host, "copying setup script")?;
            self.scripts
                .deploy(host, &target, &distro.setup, &format!("~/{name}"))
                .await
                .map_err(|err| SetupHostError::Script {
                    host_id: host.id.clone(),
                    name,
                    err,
                })?;
        }

        if !distro.teardown.is_empty() {
            Self::check_canceled(cancel, host, "copying teardown script")?;
            self.scripts
                .deploy(
                    host,
                    &target,
                    &distro.teardown,
                    &format!("~/{TEARDOWN_SCRIPT_NAME}"),
                )
                .await
                .map_err(|err| SetupHostError::Script {
                    host_id: host.id.clone(),
                    name: TEARDOWN_SCRIPT_NAME,
                    err,
                })?;
        }
        Ok(())
    }

    /// Loads the client onto a spawn host and runs its host setup.  Either
    /// failing gives up on the host immediately.
    async fn setup_spawn_host(
        &self,
        log: &Logger,
        host: &mut Host,
        options: &ProvisionOptions,
        cancel: &CancellationToken,
    ) -> Result<(), SetupHostError> {
        Self::check_canceled(cancel, host, "loading client")?;
        let loaded = match self.client.load_client(host, options).await {
            Ok(loaded) => loaded,
            Err(err) => {
                error!(
                    log,
                    "failed to load client binary onto host";
                    "error" => %DisplayErrorChain::new(&err),
                );
                self.mark_unprovisioned(log, host, err.output()).await;
                return Err(SetupHostError::Client {
                    host_id: host.id.clone(),
                    err,
                });
            }
        };

        Self::check_canceled(cancel, host, "running client host setup")?;
        if let Err(err) = self.client.run_remote_setup(host, &loaded).await {
            self.mark_unprovisioned(log, host, err.output()).await;
            return Err(SetupHostError::Client { host_id: host.id.clone(), err });
        }

        if let Some(task_id) =
            options.task_id.as_deref().filter(|task| !task.is_empty())
        {
            Self::check_canceled(cancel, host, "fetching task data")?;
            if let Err(err) =
                self.client.fetch_remote_task_data(host, task_id, &loaded).await
            {
                error!(
                    log,
                    "failed to fetch data onto host";
                    "task" => task_id,
                    "error" => %DisplayErrorChain::new(&err),
                );
            }
        }
        Ok(())
    }

    /// Gives up on `host`, recording why.
    async fn mark_unprovisioned(&self, log: &Logger, host: &mut Host, logs: &str) {
        if let Err(err) = self.hosts.set_unprovisioned(&host.id).await {
            error!(
                log,
                "failed to set host unprovisioned";
                "attempts" => host.provision_attempts,
                "error" => %DisplayErrorChain::new(&err),
            );
        }
        host.status = HostStatus::Unprovisioned;
        self.events.record(HostEvent::now(
            &host.id,
            HostEventKind::ProvisionFailed { logs: logs.to_string() },
        ));
    }

    async fn handle_failure(
        &self,
        log: &Logger,
        host: &mut Host,
        err: &SetupHostError,
    ) -> ProvisionOutcome {
        let ssh = host.bootstrap_method() == BootstrapMethod::Ssh;
        if ssh {
            // Credentials from a failed attempt are never reused.
            if let Err(discard_err) = self.credentials.discard(&host.id).await
            {
                error!(
                    log,
                    "could not delete agent credentials after failed provision \
                     attempt";
                    "attempts" => host.provision_attempts,
                    "error" => %DisplayErrorChain::new(&discard_err),
                );
            }
        }

        let kind = err.kind();
        if kind == ErrorKind::Canceled {
            info!(log, "{}", err; "attempts" => host.provision_attempts);
            return ProvisionOutcome::Canceled;
        }

        self.events.record(HostEvent::now(&host.id, HostEventKind::ProvisionError));
        error!(
            log,
            "provisioning host encountered error";
            "attempts" => host.provision_attempts,
            "error" => %DisplayErrorChain::new(err),
        );

        if kind == ErrorKind::Transient
            && should_retry_provisioning(host, self.policy.limit)
        {
            return ProvisionOutcome::RetryScheduled;
        }
        if host.status != HostStatus::Unprovisioned {
            self.mark_unprovisioned(log, host, "").await;
        }
        ProvisionOutcome::FailedTerminal
    }
}
