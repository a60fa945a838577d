// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copying scripts onto hosts.

use crate::config::Config;
use crate::expansions::{ExpansionError, Expansions};
use crate::host::{Host, HostId};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::NamedUtf8TempFile;
use host_exec::{
    scp_args, BoxedExecutor, Deadline, ExecutionError, RemoteCommand,
    SshTarget,
};
use slog::{debug, error, warn, o, Logger};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to create temporary script file")]
    TempFile(#[source] std::io::Error),
    #[error("failed to restrict permissions on {path}")]
    Permissions {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to expand script for host {host_id}")]
    Expand {
        host_id: HostId,
        #[source]
        err: ExpansionError,
    },
    #[error("failed to write local script {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error(
        "failed to copy script to {remote_path} on host {host_id}: command \
         returned {output:?}"
    )]
    Transfer {
        host_id: HostId,
        remote_path: String,
        output: String,
        #[source]
        err: ExecutionError,
    },
}

/// Expands a script, stages it locally and copies it to a host.
pub struct ScriptDeployer {
    log: Logger,
    config: Arc<Config>,
    executor: BoxedExecutor,
    expansions: Expansions,
}

impl ScriptDeployer {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        executor: BoxedExecutor,
    ) -> Self {
        let expansions = Expansions::new(config.expansions.clone());
        Self {
            log: log.new(o!("component" => "ScriptDeployer")),
            config,
            executor,
            expansions,
        }
    }

    fn scratch_file(
        &self,
        remote_path: &str,
    ) -> Result<NamedUtf8TempFile, ScriptError> {
        let prefix = Utf8Path::new(remote_path).file_name().unwrap_or("script");
        let mut builder = camino_tempfile::Builder::new();
        builder.prefix(prefix);
        let file = match &self.config.provisioning.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(ScriptError::TempFile)?;

        std::fs::set_permissions(
            file.path(),
            std::fs::Permissions::from_mode(0o700),
        )
        .map_err(|err| ScriptError::Permissions {
            path: file.path().to_owned(),
            err,
        })?;
        Ok(file)
    }

    /// Copies `script`, with placeholders expanded, to `remote_path` on
    /// `host`.
    ///
    /// The local copy is removed before returning, whatever the outcome.
    pub async fn deploy(
        &self,
        host: &Host,
        target: &SshTarget,
        script: &str,
        remote_path: &str,
    ) -> Result<(), ScriptError> {
        let start = Instant::now();
        let mut file = self.scratch_file(remote_path)?;
        let local_path = file.path().to_owned();

        let result =
            self.stage_and_copy(host, target, script, remote_path, &mut file).await;

        if let Err(err) = file.close() {
            error!(
                self.log,
                "failed to clean up after script copy";
                "host_id" => %host.id,
                "file" => %local_path,
                "error" => %err,
            );
        }
        debug!(
            self.log,
            "copy script";
            "host_id" => %host.id,
            "distro" => &host.distro.id,
            "file" => %local_path,
            "remote_path" => remote_path,
            "duration_secs" => start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn stage_and_copy(
        &self,
        host: &Host,
        target: &SshTarget,
        script: &str,
        remote_path: &str,
        file: &mut NamedUtf8TempFile,
    ) -> Result<(), ScriptError> {
        let expanded = self.expansions.expand(script).map_err(|err| {
            ScriptError::Expand { host_id: host.id.clone(), err }
        })?;
        file.write_all(expanded.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| ScriptError::Write {
                path: file.path().to_owned(),
                err,
            })?;

        let args = scp_args(
            file.path().as_str(),
            remote_path,
            target,
            &self.config.ssh.ssh_options(),
        );
        RemoteCommand::new()
            .add(args)
            .run(self.executor.as_ref(), Deadline::FileTransfer)
            .await
            .map_err(|err| {
                warn!(
                    self.log,
                    "problem copying script to host";
                    "host_id" => %host.id,
                    "distro" => &host.distro.id,
                    "remote_path" => remote_path,
                    "output" => err.output(),
                );
                ScriptError::Transfer {
                    host_id: host.id.clone(),
                    remote_path: remote_path.to_string(),
                    output: err.output().to_string(),
                    err,
                }
            })?;
        Ok(())
    }
}
