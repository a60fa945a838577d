// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the host provisioner.
//!
//! The heart of this crate is the setup-host job ([`setup_host`]): given a
//! freshly started host it installs the agent, copies distro scripts, loads
//! the command-line client onto spawn hosts and records the host as
//! provisioned, retrying transient failures a bounded number of times.

pub mod agent;
pub mod client;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod datastore;
pub mod driver;
pub mod events;
pub mod expansions;
pub mod host;
pub mod queue;
pub mod script;
pub mod setup_host;

pub use config::Config;
pub use driver::SetupHostDriver;
pub use host::{Host, HostId, HostStatus};
pub use setup_host::{
    Collaborators, HostProvisioner, JobReport, ProvisionOutcome,
    RetryDecision, SetupHostError, SetupHostJob,
};
