// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with host provisioning configuration

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for the host provisioner.
///
/// Loaded once and shared read-only (behind an `Arc`) by every component.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration for the provisioner's own log
    pub log: ConfigLogging,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    pub agent: AgentConfig,
    pub cli: CliConfig,
    pub api: ApiConfig,
    /// Values substituted into distro scripts before they are copied.
    #[serde(default)]
    pub expansions: BTreeMap<String, String>,
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Failed attempts beyond this many mark the host unprovisioned.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Delay before a follow-up attempt is eligible to run.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retry_delay_secs", default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default = "default_job_priority")]
    pub job_priority: i32,
    /// Ceiling on the output captured from any one command.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Number of hosts provisioned concurrently by the driver.
    #[serde(default = "default_worker_parallelism")]
    pub worker_parallelism: usize,
    /// Local directory for staged scripts and configs.  Defaults to the
    /// system temporary directory.
    #[serde(default)]
    pub scratch_dir: Option<Utf8PathBuf>,
}

fn default_retry_limit() -> u32 {
    15
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_job_priority() -> i32 {
    1
}

fn default_max_output_bytes() -> usize {
    host_exec::DEFAULT_MAX_OUTPUT_BYTES
}

fn default_worker_parallelism() -> usize {
    16
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            retry_delay: default_retry_delay(),
            job_priority: default_job_priority(),
            max_output_bytes: default_max_output_bytes(),
            worker_parallelism: default_worker_parallelism(),
            scratch_dir: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// Private key handed to ssh and scp with `-i`.
    #[serde(default)]
    pub identity_file: Option<Utf8PathBuf>,
    /// Extra `-o` options, e.g. `ConnectTimeout=10`.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "default_ssh_port")]
    pub default_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            options: Vec::new(),
            default_port: default_ssh_port(),
        }
    }
}

impl SshConfig {
    /// Transport arguments shared by every ssh and scp invocation.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

/// Where the remote agent comes from and how it is installed.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Base URL; binaries live under `<url>/<version>/<arch>/<binary>`.
    pub download_url: String,
    pub version: String,
    #[serde(default = "default_agent_binary_name")]
    pub binary_name: String,
    #[serde(default = "default_agent_install_dir")]
    pub install_dir: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_windows_credentials_path")]
    pub windows_credentials_path: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    /// Account the agent service runs as on Windows hosts.
    #[serde(default = "default_service_user")]
    pub service_user: String,
}

fn default_agent_binary_name() -> String {
    "hostprov-agent".to_string()
}

fn default_agent_install_dir() -> String {
    "/usr/local/bin".to_string()
}

fn default_credentials_path() -> String {
    "/etc/hostprov/agent-credentials.json".to_string()
}

fn default_windows_credentials_path() -> String {
    "/cygdrive/c/hostprov/agent-credentials.json".to_string()
}

fn default_agent_port() -> u16 {
    2385
}

fn default_service_user() -> String {
    "hostprov-agent".to_string()
}

/// The command-line client loaded onto hosts that ask for it.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Base URL; binaries live under `<url>/<arch>/<binary>`.
    pub download_url: String,
    #[serde(default = "default_cli_binary_name")]
    pub binary_name: String,
    /// Directory under the remote home that receives the client.
    #[serde(default = "default_cli_target_dir")]
    pub target_dir: String,
    #[serde(default = "default_cli_config_file_name")]
    pub config_file_name: String,
}

fn default_cli_binary_name() -> String {
    "hostprov".to_string()
}

fn default_cli_target_dir() -> String {
    "cli_bin".to_string()
}

fn default_cli_config_file_name() -> String {
    ".hostprov.yml".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub api_url: String,
    pub ui_url: String,
}
