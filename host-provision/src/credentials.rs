// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Issuing the remote agent's credentials.

use crate::config::Config;
use crate::datastore::{CredentialStore, StoreError};
use crate::host::{Host, HostId};
use base64::Engine;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use host_exec::{
    shell_quote, BoxedExecutor, Deadline, ExecutionError, RemoteCommand,
    SshTarget,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use uuid::Uuid;

const SECRET_BYTES: usize = 32;

/// Secret material the agent uses to authenticate its callers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub key_id: Uuid,
    /// Base64-encoded random bytes.
    pub secret: String,
    pub issued_at: DateTime<Utc>,
}

impl CredentialBundle {
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            key_id: Uuid::new_v4(),
            secret: base64::engine::general_purpose::STANDARD.encode(secret),
            issued_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to encode credentials for host {host_id}")]
    Encode {
        host_id: HostId,
        #[source]
        err: serde_json::Error,
    },
    #[error("credentials path {path:?} has no parent directory")]
    InvalidPath { path: String },
    #[error("failed to build credentials command for host {host_id}")]
    Command {
        host_id: HostId,
        #[source]
        err: ExecutionError,
    },
    #[error(
        "failed to write credentials on host {host_id}: command returned {output:?}"
    )]
    RemoteWrite {
        host_id: HostId,
        output: String,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to save credentials for host {host_id}")]
    Save {
        host_id: HostId,
        #[source]
        err: StoreError,
    },
    #[error("failed to delete credentials for host {host_id}")]
    Delete {
        host_id: HostId,
        #[source]
        err: StoreError,
    },
}

/// Generates credentials, puts them on a host, and only then records them.
pub struct CredentialProvisioner {
    log: Logger,
    config: Arc<Config>,
    executor: BoxedExecutor,
    store: Arc<dyn CredentialStore>,
}

impl CredentialProvisioner {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        executor: BoxedExecutor,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "CredentialProvisioner")),
            config,
            executor,
            store,
        }
    }

    /// Where the agent expects its credentials on `host`.
    pub fn credentials_path(&self, host: &Host) -> &str {
        if host.distro.is_windows() {
            &self.config.agent.windows_credentials_path
        } else {
            &self.config.agent.credentials_path
        }
    }

    /// A shell command line that writes `bundle` to the agent's credentials
    /// file, readable only by its owner.
    pub fn write_command(
        &self,
        host: &Host,
        bundle: &CredentialBundle,
    ) -> Result<String, CredentialError> {
        let contents = serde_json::to_vec(bundle).map_err(|err| {
            CredentialError::Encode { host_id: host.id.clone(), err }
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(contents);

        let path = self.credentials_path(host);
        let dir = Utf8Path::new(path)
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .ok_or_else(|| CredentialError::InvalidPath {
                path: path.to_string(),
            })?;
        let quote = |s: &str| {
            shell_quote(s).map_err(|err| CredentialError::Command {
                host_id: host.id.clone(),
                err,
            })
        };
        let dir = quote(dir.as_str())?;
        let path = quote(path)?;

        Ok(format!(
            "mkdir -p {dir} && echo '{encoded}' | base64 --decode > {path} \
             && chmod 600 {path}"
        ))
    }

    /// Issues a fresh bundle for `host`.
    ///
    /// The bundle is saved only once the host has it, so a failed write
    /// leaves nothing behind in the store.
    pub async fn issue(
        &self,
        host: &Host,
        target: &SshTarget,
    ) -> Result<CredentialBundle, CredentialError> {
        let bundle = CredentialBundle::generate();
        let command = self.write_command(host, &bundle)?;

        info!(
            self.log,
            "putting agent credentials on host";
            "host_id" => %host.id,
            "distro" => &host.distro.id,
            "key_id" => %bundle.key_id,
        );

        RemoteCommand::new()
            .target(target)
            .extend_remote_args(self.config.ssh.ssh_options())
            .append(command)
            .run(self.executor.as_ref(), Deadline::FileTransfer)
            .await
            .map_err(|err| {
                warn!(
                    self.log,
                    "failed to write agent credentials";
                    "host_id" => %host.id,
                    "output" => err.output(),
                );
                CredentialError::RemoteWrite {
                    host_id: host.id.clone(),
                    output: err.output().to_string(),
                    err,
                }
            })?;

        self.store.save_credentials(&host.id, &bundle).await.map_err(
            |err| CredentialError::Save { host_id: host.id.clone(), err },
        )?;
        Ok(bundle)
    }

    /// Forgets any credentials issued to `host_id`.
    pub async fn discard(&self, host_id: &HostId) -> Result<(), CredentialError> {
        self.store
            .delete_credentials(host_id)
            .await
            .map_err(|err| CredentialError::Delete { host_id: host_id.clone(), err })
    }
}
