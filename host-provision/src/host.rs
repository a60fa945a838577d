// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosts, distros and the users that own them.

use chrono::{DateTime, Utc};
use host_exec::SshTarget;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How a new host becomes able to run work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapMethod {
    /// Nothing to install; the image is ready as-is.
    None,
    /// The host bootstraps itself from cloud-init user data.
    UserData,
    /// The agent is installed over SSH.
    Ssh,
}

impl fmt::Display for BootstrapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapMethod::None => "none",
            BootstrapMethod::UserData => "user-data",
            BootstrapMethod::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStatus {
    Starting,
    Provisioning,
    /// Provisioned from our side, waiting on the host to finish bootstrapping
    /// itself.
    ProvisionedNotRunning,
    Provisioned,
    Running,
    /// Provisioning gave up on this host.
    Unprovisioned,
    Terminated,
}

impl HostStatus {
    fn rank(self) -> Option<u8> {
        match self {
            HostStatus::Starting => Some(0),
            HostStatus::Provisioning => Some(1),
            HostStatus::ProvisionedNotRunning => Some(2),
            HostStatus::Provisioned => Some(3),
            HostStatus::Running => Some(4),
            HostStatus::Terminated => Some(5),
            HostStatus::Unprovisioned => None,
        }
    }

    /// Returns true if a host in this status may move to `next`.
    ///
    /// Statuses only move forward, except that any live host may fail over
    /// to [`HostStatus::Unprovisioned`], from which it can only terminate.
    pub fn can_transition_to(self, next: HostStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (HostStatus::Terminated, _) => false,
            (HostStatus::Unprovisioned, next) => next == HostStatus::Terminated,
            (_, HostStatus::Unprovisioned) => true,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Statuses from which provisioning has nothing left to do.
    ///
    /// Wider than "already running": `Unprovisioned` and `Terminated` are
    /// included too, so a redelivered job for a host that was given up on or
    /// torn down skips it without counting an attempt or emitting events.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            HostStatus::Running
                | HostStatus::Unprovisioned
                | HostStatus::Terminated
        )
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Starting => "starting",
            HostStatus::Provisioning => "provisioning",
            HostStatus::ProvisionedNotRunning => "provisioned-not-running",
            HostStatus::Provisioned => "provisioned",
            HostStatus::Running => "running",
            HostStatus::Unprovisioned => "unprovisioned",
            HostStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distro {
    pub id: String,
    /// e.g. `linux_amd64`, `windows_amd64`, `darwin_arm64`.
    pub arch: String,
    /// Default login user.
    pub user: String,
    pub bootstrap_method: BootstrapMethod,
    /// Script copied to the host after the agent is installed.
    #[serde(default)]
    pub setup: String,
    #[serde(default)]
    pub teardown: String,
    #[serde(default)]
    pub work_dir: String,
}

impl Distro {
    pub fn is_windows(&self) -> bool {
        self.arch.starts_with("windows")
    }

    /// Windows setup scripts without a shebang line are run by PowerShell.
    pub fn is_powershell_setup(&self) -> bool {
        self.is_windows() && !self.setup.trim_start().starts_with("#!")
    }

    pub fn home_dir(&self) -> String {
        if self.user == "root" {
            "/root".to_string()
        } else if self.arch.starts_with("darwin") {
            format!("/Users/{}", self.user)
        } else {
            format!("/home/{}", self.user)
        }
    }

    /// The on-disk name of an executable called `name`.
    pub fn executable_name(&self, name: &str) -> String {
        if self.is_windows() {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }
}

/// What the owner of a spawn host asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOptions {
    pub owner_id: String,
    /// Task whose source and artifacts are fetched onto the host.
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub load_cli: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Created by a running task rather than by a user.
    #[serde(default)]
    pub spawned_by_task: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub distro: Distro,
    pub status: HostStatus,
    #[serde(default)]
    pub provision_attempts: u32,
    #[serde(default)]
    pub provisioned: bool,
    /// DNS name, optionally as `user@name:port`.
    #[serde(default)]
    pub dns_name: String,
    #[serde(default)]
    pub ip: String,
    /// Login user overriding the distro's.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub spawn_options: SpawnOptions,
    #[serde(default)]
    pub provision_options: Option<ProvisionOptions>,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub provision_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_communicated: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SshInfoError {
    #[error("host {host_id} has neither a DNS name nor an IP address")]
    NoAddress { host_id: HostId },
    #[error("host {host_id} has an invalid port in address {address:?}")]
    InvalidPort { host_id: HostId, address: String },
    #[error("host {host_id} has no login user")]
    NoUser { host_id: HostId },
}

impl Host {
    pub fn new(id: impl Into<String>, distro: Distro) -> Self {
        Self {
            id: HostId::new(id),
            distro,
            status: HostStatus::Starting,
            provision_attempts: 0,
            provisioned: false,
            dns_name: String::new(),
            ip: String::new(),
            user: String::new(),
            provider: String::new(),
            spawn_options: SpawnOptions::default(),
            provision_options: None,
            creation_time: Utc::now(),
            provision_time: None,
            last_communicated: None,
        }
    }

    pub fn bootstrap_method(&self) -> BootstrapMethod {
        self.distro.bootstrap_method
    }

    /// Options requesting the client, if any were given.
    pub fn client_options(&self) -> Option<&ProvisionOptions> {
        self.provision_options.as_ref().filter(|options| options.load_cli)
    }

    /// Resolves how to reach this host over SSH.
    ///
    /// The address may be `host`, `host:port` or `user@host:port`.  A user
    /// embedded in the address wins over the host's user, which wins over
    /// the distro's.
    pub fn ssh_target(
        &self,
        default_port: u16,
    ) -> Result<SshTarget, SshInfoError> {
        let address =
            if self.dns_name.is_empty() { &self.ip } else { &self.dns_name };
        if address.is_empty() {
            return Err(SshInfoError::NoAddress { host_id: self.id.clone() });
        }

        let (user, rest) = match address.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => ("", address.as_str()),
        };
        let (hostname, port) = match rest.rsplit_once(':') {
            // Bare IPv6 addresses contain colons but no port.
            Some((hostname, port)) if !hostname.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    SshInfoError::InvalidPort {
                        host_id: self.id.clone(),
                        address: address.clone(),
                    }
                })?;
                (hostname, port)
            }
            _ => (rest, default_port),
        };
        if hostname.is_empty() {
            return Err(SshInfoError::NoAddress { host_id: self.id.clone() });
        }

        let user = [user, self.user.as_str(), self.distro.user.as_str()]
            .into_iter()
            .find(|user| !user.is_empty())
            .ok_or_else(|| SshInfoError::NoUser { host_id: self.id.clone() })?;

        Ok(SshTarget {
            hostname: hostname.to_string(),
            user: user.to_string(),
            port,
        })
    }
}

/// The owner of a spawn host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub api_key: String,
}
