// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading the command-line client onto spawn hosts.

use crate::config::Config;
use crate::datastore::{StoreError, UserStore};
use crate::host::{Host, HostId, ProvisionOptions, SshInfoError};
use camino_tempfile::NamedUtf8TempFile;
use host_exec::{
    scp_args, shell_quote, BoxedExecutor, Deadline, ExecutionError,
    RemoteCommand, SshTarget,
};
use serde::Serialize;
use slog::{error, info, o, Logger};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

const KNOWN_HOSTS_OPTION: [&str; 2] = ["-o", "UserKnownHostsFile=/dev/null"];

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("host {host_id} has no owner to load the client for")]
    MissingOwner { host_id: HostId },
    #[error("owner {owner_id} of host {host_id} does not exist")]
    OwnerNotFound { host_id: HostId, owner_id: String },
    #[error("failed to look up owner {owner_id}")]
    OwnerLookup {
        owner_id: String,
        #[source]
        err: StoreError,
    },
    #[error(transparent)]
    SshInfo(#[from] SshInfoError),
    #[error("failed to stage client config for host {host_id}")]
    StageConfig {
        host_id: HostId,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to build client command for host {host_id}")]
    Command {
        host_id: HostId,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to {step} on host {host_id}: command returned {output:?}")]
    Remote {
        host_id: HostId,
        step: &'static str,
        output: String,
        #[source]
        err: ExecutionError,
    },
}

impl ClientError {
    /// Problems with the host's request itself, which retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ClientError::MissingOwner { .. } | ClientError::OwnerNotFound { .. }
        )
    }

    /// Output captured from the remote side, if any.
    pub fn output(&self) -> &str {
        match self {
            ClientError::Remote { output, .. } => output,
            _ => "",
        }
    }
}

/// Where the client and its config ended up on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadClientResult {
    pub binary_path: String,
    pub config_path: String,
}

/// Per-owner settings read by the client.
#[derive(Serialize)]
struct ClientSettings<'a> {
    api_key: &'a str,
    api_server_host: String,
    ui_server_host: &'a str,
    user: &'a str,
}

pub struct ClientDeployer {
    log: Logger,
    config: Arc<Config>,
    executor: BoxedExecutor,
    users: Arc<dyn UserStore>,
}

/// Creates the client directory and puts it on the remote `PATH`.  Safe to
/// run repeatedly: the `PATH` line is only appended to a profile that does not
/// already contain it.
fn prepare_dir_command(dir: &str) -> String {
    let path_line = format!(r#"export PATH="$PATH:~/{dir}""#);
    let append = |profile: &str| {
        format!(
            "(grep -qxF '{path_line}' {profile} 2>/dev/null || \
             echo '{path_line}' >> {profile} || true)"
        )
    };
    format!(
        "mkdir -m 777 -p ~/{dir} && {} && {}",
        append("~/.profile"),
        append("~/.bash_profile")
    )
}

impl ClientDeployer {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        executor: BoxedExecutor,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "ClientDeployer")),
            config,
            executor,
            users,
        }
    }

    fn remote(&self, target: &SshTarget) -> RemoteCommand {
        RemoteCommand::new()
            .target(target)
            .extend_remote_args(self.ssh_options())
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut options = self.config.ssh.ssh_options();
        options.extend(KNOWN_HOSTS_OPTION.map(String::from));
        options
    }

    fn remote_error<'a>(
        host: &'a Host,
        step: &'static str,
    ) -> impl FnOnce(ExecutionError) -> ClientError + 'a {
        move |err| ClientError::Remote {
            host_id: host.id.clone(),
            step,
            output: err.output().to_string(),
            err,
        }
    }

    /// Places the client and a config for the host's owner on `host`, with
    /// the client directory added to the login `PATH`.
    pub async fn load_client(
        &self,
        host: &Host,
        options: &ProvisionOptions,
    ) -> Result<LoadClientResult, ClientError> {
        if options.owner_id.is_empty() {
            return Err(ClientError::MissingOwner { host_id: host.id.clone() });
        }
        let owner = self
            .users
            .find_user(&options.owner_id)
            .await
            .map_err(|err| ClientError::OwnerLookup {
                owner_id: options.owner_id.clone(),
                err,
            })?
            .ok_or_else(|| ClientError::OwnerNotFound {
                host_id: host.id.clone(),
                owner_id: options.owner_id.clone(),
            })?;

        let target = host.ssh_target(self.config.ssh.default_port)?;
        let cli = &self.config.cli;
        let dir = &cli.target_dir;

        info!(
            self.log,
            "uploading client binary to host";
            "host_id" => %host.id,
            "owner" => &owner.id,
        );

        self.remote(&target)
            .append(prepare_dir_command(dir))
            .run(self.executor.as_ref(), Deadline::RemoteShellSetup)
            .await
            .map_err(Self::remote_error(host, "prepare client directory"))?;

        let binary = host.distro.executable_name(&cli.binary_name);
        let binary_path = format!("~/{dir}/{binary}");
        let url = format!(
            "{}/{}/{}",
            cli.download_url.trim_end_matches('/'),
            host.distro.arch,
            binary
        );
        let url = shell_quote(&url).map_err(|err| ClientError::Command {
            host_id: host.id.clone(),
            err,
        })?;
        self.remote(&target)
            .append(format!(
                "cd ~/{dir} && curl -fLsS -o {binary} {url} && chmod +x {binary}"
            ))
            .run(self.executor.as_ref(), Deadline::BinaryDownload)
            .await
            .map_err(Self::remote_error(host, "download client"))?;

        let settings = ClientSettings {
            api_key: &owner.api_key,
            api_server_host: format!(
                "{}/api",
                self.config.api.api_url.trim_end_matches('/')
            ),
            ui_server_host: &self.config.api.ui_url,
            user: &owner.id,
        };
        let config_path = format!("~/{dir}/{}", cli.config_file_name);
        let staged = self.stage_settings(host, &settings)?;
        let args = scp_args(
            staged.path().as_str(),
            &config_path,
            &target,
            &self.ssh_options(),
        );
        let copied = RemoteCommand::new()
            .add(args)
            .run(self.executor.as_ref(), Deadline::FileTransfer)
            .await
            .map_err(Self::remote_error(host, "copy client config"));
        if let Err(err) = staged.close() {
            error!(
                self.log,
                "failed to remove staged client config";
                "host_id" => %host.id,
                "error" => %err,
            );
        }
        copied?;

        Ok(LoadClientResult { binary_path, config_path })
    }

    fn stage_settings(
        &self,
        host: &Host,
        settings: &ClientSettings<'_>,
    ) -> Result<NamedUtf8TempFile, ClientError> {
        let stage_error =
            |err| ClientError::StageConfig { host_id: host.id.clone(), err };
        let contents =
            serde_json::to_vec(settings).map_err(std::io::Error::from).map_err(stage_error)?;

        let mut file = match &self.config.provisioning.scratch_dir {
            Some(dir) => NamedUtf8TempFile::new_in(dir),
            None => NamedUtf8TempFile::new(),
        }
        .map_err(stage_error)?;
        std::fs::set_permissions(
            file.path(),
            std::fs::Permissions::from_mode(0o600),
        )
        .map_err(stage_error)?;
        file.write_all(&contents)
            .and_then(|()| file.flush())
            .map_err(stage_error)?;
        Ok(file)
    }

    /// Runs the client's own host setup on a freshly loaded spawn host.
    pub async fn run_remote_setup(
        &self,
        host: &Host,
        client: &LoadClientResult,
    ) -> Result<(), ClientError> {
        let target = host.ssh_target(self.config.ssh.default_port)?;
        let mut command =
            format!("{} -c {} host setup", client.binary_path, client.config_path);
        if !host.distro.work_dir.is_empty() {
            let work_dir = shell_quote(&host.distro.work_dir).map_err(|err| {
                ClientError::Command { host_id: host.id.clone(), err }
            })?;
            command.push_str(&format!(" --working_directory={work_dir}"));
        }

        info!(self.log, "running setup script for spawn host"; "host_id" => %host.id);
        self.remote(&target)
            .append(command)
            .run(self.executor.as_ref(), Deadline::RemoteSetup)
            .await
            .map_err(Self::remote_error(host, "run client host setup"))?;
        Ok(())
    }

    /// Pulls a task's source and artifacts into the distro's working
    /// directory using the loaded client.
    pub async fn fetch_remote_task_data(
        &self,
        host: &Host,
        task_id: &str,
        client: &LoadClientResult,
    ) -> Result<(), ClientError> {
        let target = host.ssh_target(self.config.ssh.default_port)?;
        let quote = |s: &str| {
            shell_quote(s).map_err(|err| ClientError::Command {
                host_id: host.id.clone(),
                err,
            })
        };
        let command = format!(
            "{} -c {} fetch -t {} --source --artifacts --dir={}",
            client.binary_path,
            client.config_path,
            quote(task_id)?,
            quote(&host.distro.work_dir)?,
        );

        info!(
            self.log,
            "fetching data for task on host";
            "host_id" => %host.id,
            "task" => task_id,
        );
        self.remote(&target)
            .append(command)
            .run(self.executor.as_ref(), Deadline::ArtifactFetch)
            .await
            .map_err(Self::remote_error(host, "fetch task data"))?;
        Ok(())
    }
}
