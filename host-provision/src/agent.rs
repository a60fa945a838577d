// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Getting the remote agent running on a host.

use crate::config::Config;
use crate::credentials::{CredentialError, CredentialProvisioner};
use crate::datastore::{HostStore, StoreError, StoreOp};
use crate::host::{BootstrapMethod, Host, HostId, HostStatus, SshInfoError};
use crate::script::{ScriptDeployer, ScriptError};
use chrono::Utc;
use display_error_chain::DisplayErrorChain;
use host_exec::{
    shell_quote, BoxedExecutor, Deadline, ExecutionError, RemoteCommand,
    SshTarget,
};
use rand::distributions::{Alphanumeric, DistString};
use slog::{error, info, o, Logger};
use std::sync::Arc;

const SERVICE_USER_SCRIPT: &str = "setup-user.ps1";
const SERVICE_PASSWORD_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    SshInfo(#[from] SshInfoError),
    #[error("failed to stage service user script on host {host_id}")]
    ServiceUserScript {
        host_id: HostId,
        #[source]
        err: ScriptError,
    },
    #[error(
        "failed to set up service user on host {host_id}: command returned \
         {output:?}"
    )]
    ServiceUser {
        host_id: HostId,
        output: String,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to put agent credentials on host")]
    Credentials(#[from] CredentialError),
    #[error("failed to build agent command for host {host_id}")]
    Command {
        host_id: HostId,
        #[source]
        err: ExecutionError,
    },
    #[error(
        "failed to fetch agent and reinstall service on host {host_id}: \
         command returned {output:?}"
    )]
    Reinstall {
        host_id: HostId,
        output: String,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to {op} for host {host_id}")]
    Persist {
        host_id: HostId,
        op: StoreOp,
        #[source]
        err: StoreError,
    },
}

/// What [`AgentInstaller::install`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The distro needs no agent.
    NotRequired,
    /// The host installs the agent itself from user data.
    AwaitingUserData,
    /// The agent was installed and (re)started over SSH.
    Installed,
}

/// Account the agent service runs as on Windows.
struct ServiceUser {
    name: String,
    password: String,
}

pub struct AgentInstaller {
    log: Logger,
    config: Arc<Config>,
    executor: BoxedExecutor,
    hosts: Arc<dyn HostStore>,
    credentials: Arc<CredentialProvisioner>,
    scripts: Arc<ScriptDeployer>,
}

impl AgentInstaller {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        executor: BoxedExecutor,
        hosts: Arc<dyn HostStore>,
        credentials: Arc<CredentialProvisioner>,
        scripts: Arc<ScriptDeployer>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "AgentInstaller")),
            config,
            executor,
            hosts,
            credentials,
            scripts,
        }
    }

    /// Gets the agent onto `host` according to its bootstrap method.
    ///
    /// Status changes are persisted and mirrored into `host`.  On failure any
    /// credentials issued along the way are left for the caller to discard.
    pub async fn install(
        &self,
        host: &mut Host,
    ) -> Result<InstallOutcome, AgentError> {
        match host.bootstrap_method() {
            BootstrapMethod::None => Ok(InstallOutcome::NotRequired),
            BootstrapMethod::UserData => {
                self.await_user_data(host).await?;
                Ok(InstallOutcome::AwaitingUserData)
            }
            BootstrapMethod::Ssh => {
                self.install_over_ssh(host).await?;
                Ok(InstallOutcome::Installed)
            }
        }
    }

    async fn await_user_data(&self, host: &mut Host) -> Result<(), AgentError> {
        // Keeps the agent deploy path from racing the user data script.
        let now = Utc::now();
        match self.hosts.update_last_communicated(&host.id, now).await {
            Ok(()) => host.last_communicated = Some(now),
            Err(err) => error!(
                self.log,
                "failed to update host's last communication time";
                "host_id" => %host.id,
                "distro" => &host.distro.id,
                "error" => %DisplayErrorChain::new(&err),
            ),
        }

        // The host is not running until its user data finishes.
        self.hosts.set_provisioned_not_running(&host.id).await.map_err(
            |err| AgentError::Persist {
                host_id: host.id.clone(),
                op: StoreOp::SetProvisionedNotRunning,
                err,
            },
        )?;
        host.status = HostStatus::ProvisionedNotRunning;
        host.provisioned = false;

        info!(
            self.log,
            "host provisioned, awaiting host to finish provisioning itself";
            "host_id" => %host.id,
            "distro" => &host.distro.id,
            "attempts" => host.provision_attempts,
            "provision_duration_secs" =>
                (now - host.creation_time).num_seconds(),
        );
        Ok(())
    }

    async fn install_over_ssh(&self, host: &Host) -> Result<(), AgentError> {
        let target = host.ssh_target(self.config.ssh.default_port)?;

        let service_user = if host.distro.is_windows() {
            Some(self.setup_service_user(host, &target).await?)
        } else {
            None
        };

        self.credentials.issue(host, &target).await?;

        let command =
            self.fetch_and_reinstall_command(host, service_user.as_ref())?;
        self.remote(&target)
            .append(command)
            .run(self.executor.as_ref(), Deadline::BinaryDownload)
            .await
            .map_err(|err| AgentError::Reinstall {
                host_id: host.id.clone(),
                output: err.output().to_string(),
                err,
            })?;

        info!(
            self.log,
            "fetched agent binary and started service";
            "host_id" => %host.id,
            "distro" => &host.distro.id,
        );
        Ok(())
    }

    fn remote(&self, target: &SshTarget) -> RemoteCommand {
        RemoteCommand::new()
            .target(target)
            .extend_remote_args(self.config.ssh.ssh_options())
    }

    async fn setup_service_user(
        &self,
        host: &Host,
        target: &SshTarget,
    ) -> Result<ServiceUser, AgentError> {
        let user = ServiceUser {
            name: self.config.agent.service_user.clone(),
            password: Alphanumeric
                .sample_string(&mut rand::thread_rng(), SERVICE_PASSWORD_LEN),
        };

        let path = format!("{}/{}", host.distro.home_dir(), SERVICE_USER_SCRIPT);
        self.scripts
            .deploy(host, target, &service_user_script(&user), &path)
            .await
            .map_err(|err| AgentError::ServiceUserScript {
                host_id: host.id.clone(),
                err,
            })?;

        self.remote(target)
            .append(format!(
                "powershell ./{SERVICE_USER_SCRIPT} && rm -f ./{SERVICE_USER_SCRIPT}"
            ))
            .run(self.executor.as_ref(), Deadline::RemoteShellSetup)
            .await
            .map_err(|err| AgentError::ServiceUser {
                host_id: host.id.clone(),
                output: err.output().to_string(),
                err,
            })?;
        Ok(user)
    }

    /// One remote command line that downloads the configured agent and
    /// reinstalls it as a service.
    fn fetch_and_reinstall_command(
        &self,
        host: &Host,
        service_user: Option<&ServiceUser>,
    ) -> Result<String, AgentError> {
        let agent = &self.config.agent;
        let quote = |s: &str| {
            shell_quote(s).map_err(|err| AgentError::Command {
                host_id: host.id.clone(),
                err,
            })
        };

        let binary = host.distro.executable_name(&agent.binary_name);
        let url = format!(
            "{}/{}/{}/{}",
            agent.download_url.trim_end_matches('/'),
            agent.version,
            host.distro.arch,
            binary
        );
        let install_dir = quote(&agent.install_dir)?;
        let binary_q = quote(&binary)?;
        let creds_path = quote(self.credentials.credentials_path(host))?;

        let mut reinstall = format!(
            "./{binary_q} service force-reinstall --port={} --creds_path={creds_path}",
            agent.port
        );
        match service_user {
            Some(user) => {
                reinstall.push_str(&format!(
                    " --user={} --password={}",
                    quote(&user.name)?,
                    quote(&user.password)?
                ));
            }
            None => reinstall = format!("sudo {reinstall}"),
        }

        Ok(format!(
            "mkdir -p {install_dir} && cd {install_dir} && curl -fLsS -o \
             {binary_q} {} && chmod +x {binary_q} && {reinstall}",
            quote(&url)?
        ))
    }
}

fn service_user_script(user: &ServiceUser) -> String {
    format!(
        r#"$ErrorActionPreference = "Stop"
$password = ConvertTo-SecureString -String '{password}' -AsPlainText -Force
if (Get-LocalUser -Name '{name}' -ErrorAction SilentlyContinue) {{
    Set-LocalUser -Name '{name}' -Password $password
}} else {{
    New-LocalUser -Name '{name}' -Password $password -PasswordNeverExpires
}}
Add-LocalGroupMember -Group 'Administrators' -Member '{name}' -ErrorAction SilentlyContinue
"#,
        name = user.name,
        password = user.password,
    )
}
