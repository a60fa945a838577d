// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence of hosts, agent credentials and users.

use crate::credentials::CredentialBundle;
use crate::host::{Host, HostId, HostStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

/// A single kind of write against the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreOp {
    IncrementAttempts,
    SetDnsName,
    SetProvisionedNotRunning,
    SetUnprovisioned,
    MarkProvisioned,
    UpdateLastCommunicated,
    SaveCredentials,
    DeleteCredentials,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreOp::IncrementAttempts => "increment provision attempts",
            StoreOp::SetDnsName => "set DNS name",
            StoreOp::SetProvisionedNotRunning => "set provisioned-not-running",
            StoreOp::SetUnprovisioned => "set unprovisioned",
            StoreOp::MarkProvisioned => "mark provisioned",
            StoreOp::UpdateLastCommunicated => "update last communicated",
            StoreOp::SaveCredentials => "save credentials",
            StoreOp::DeleteCredentials => "delete credentials",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("host {0} not found")]
    HostNotFound(HostId),
    #[error("host {host_id} cannot move from {from} to {to}")]
    InvalidTransition { host_id: HostId, from: HostStatus, to: HostStatus },
    #[error("store unavailable during {op} for {id}")]
    Unavailable { op: StoreOp, id: String },
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn find_host(&self, id: &HostId) -> Result<Option<Host>, StoreError>;

    /// Increments the attempt count, returning the new value.
    async fn increment_provision_attempts(
        &self,
        id: &HostId,
    ) -> Result<u32, StoreError>;

    async fn set_dns_name(
        &self,
        id: &HostId,
        dns_name: &str,
    ) -> Result<(), StoreError>;

    async fn set_provisioned_not_running(
        &self,
        id: &HostId,
    ) -> Result<(), StoreError>;

    async fn set_unprovisioned(&self, id: &HostId) -> Result<(), StoreError>;

    async fn mark_as_provisioned(
        &self,
        id: &HostId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_last_communicated(
        &self,
        id: &HostId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Agent credentials, at most one bundle per host.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Stores `bundle`, replacing any earlier bundle for the host.
    async fn save_credentials(
        &self,
        host_id: &HostId,
        bundle: &CredentialBundle,
    ) -> Result<(), StoreError>;

    /// Deleting credentials that do not exist succeeds.
    async fn delete_credentials(&self, host_id: &HostId)
        -> Result<(), StoreError>;

    async fn find_credentials(
        &self,
        host_id: &HostId,
    ) -> Result<Option<CredentialBundle>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError>;
}

#[derive(Default)]
struct Inner {
    hosts: BTreeMap<HostId, Host>,
    credentials: BTreeMap<HostId, CredentialBundle>,
    users: BTreeMap<String, User>,
    failing: BTreeSet<StoreOp>,
    writes: usize,
}

impl Inner {
    fn check(&self, op: StoreOp, id: &HostId) -> Result<(), StoreError> {
        if self.failing.contains(&op) {
            return Err(StoreError::Unavailable { op, id: id.to_string() });
        }
        Ok(())
    }

    fn host_mut(&mut self, id: &HostId) -> Result<&mut Host, StoreError> {
        self.hosts
            .get_mut(id)
            .ok_or_else(|| StoreError::HostNotFound(id.clone()))
    }

    fn transition(
        &mut self,
        id: &HostId,
        op: StoreOp,
        to: HostStatus,
    ) -> Result<&mut Host, StoreError> {
        self.check(op, id)?;
        let host = self.host_mut(id)?;
        if !host.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                host_id: id.clone(),
                from: host.status,
                to,
            });
        }
        host.status = to;
        Ok(host)
    }
}

/// Keeps everything in memory.
///
/// Backs the `setup-host` tool and the test suite; individual operations can
/// be made to fail with [`InMemoryDataStore::fail_on`].
#[derive(Default)]
pub struct InMemoryDataStore {
    inner: Mutex<Inner>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_host(&self, host: Host) {
        let mut inner = self.inner.lock().unwrap();
        inner.hosts.insert(host.id.clone(), host);
    }

    pub fn insert_user(&self, user: User) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user.id.clone(), user);
    }

    pub fn host(&self, id: &HostId) -> Option<Host> {
        self.inner.lock().unwrap().hosts.get(id).cloned()
    }

    pub fn credentials(&self, id: &HostId) -> Option<CredentialBundle> {
        self.inner.lock().unwrap().credentials.get(id).cloned()
    }

    pub fn credential_count(&self) -> usize {
        self.inner.lock().unwrap().credentials.len()
    }

    /// Makes every subsequent `op` fail until [`Self::clear_failures`].
    pub fn fail_on(&self, op: StoreOp) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failing.clear();
    }

    /// Number of successful writes of any kind.
    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes
    }
}

#[async_trait]
impl HostStore for InMemoryDataStore {
    async fn find_host(&self, id: &HostId) -> Result<Option<Host>, StoreError> {
        Ok(self.host(id))
    }

    async fn increment_provision_attempts(
        &self,
        id: &HostId,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::IncrementAttempts, id)?;
        let host = inner.host_mut(id)?;
        host.provision_attempts += 1;
        let attempts = host.provision_attempts;
        inner.writes += 1;
        Ok(attempts)
    }

    async fn set_dns_name(
        &self,
        id: &HostId,
        dns_name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::SetDnsName, id)?;
        inner.host_mut(id)?.dns_name = dns_name.to_string();
        inner.writes += 1;
        Ok(())
    }

    async fn set_provisioned_not_running(
        &self,
        id: &HostId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner.transition(
            id,
            StoreOp::SetProvisionedNotRunning,
            HostStatus::ProvisionedNotRunning,
        )?;
        host.provisioned = false;
        inner.writes += 1;
        Ok(())
    }

    async fn set_unprovisioned(&self, id: &HostId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::SetUnprovisioned, id)?;
        let host = inner.host_mut(id)?;
        if host.provisioned {
            return Err(StoreError::InvalidTransition {
                host_id: id.clone(),
                from: host.status,
                to: HostStatus::Unprovisioned,
            });
        }
        inner.transition(
            id,
            StoreOp::SetUnprovisioned,
            HostStatus::Unprovisioned,
        )?;
        inner.writes += 1;
        Ok(())
    }

    async fn mark_as_provisioned(
        &self,
        id: &HostId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner.transition(
            id,
            StoreOp::MarkProvisioned,
            HostStatus::Provisioned,
        )?;
        host.provisioned = true;
        host.provision_time = Some(at);
        inner.writes += 1;
        Ok(())
    }

    async fn update_last_communicated(
        &self,
        id: &HostId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::UpdateLastCommunicated, id)?;
        inner.host_mut(id)?.last_communicated = Some(at);
        inner.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryDataStore {
    async fn save_credentials(
        &self,
        host_id: &HostId,
        bundle: &CredentialBundle,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::SaveCredentials, host_id)?;
        inner.credentials.insert(host_id.clone(), bundle.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn delete_credentials(
        &self,
        host_id: &HostId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(StoreOp::DeleteCredentials, host_id)?;
        if inner.credentials.remove(host_id).is_some() {
            inner.writes += 1;
        }
        Ok(())
    }

    async fn find_credentials(
        &self,
        host_id: &HostId,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        Ok(self.credentials(host_id))
    }
}

#[async_trait]
impl UserStore for InMemoryDataStore {
    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(id).cloned())
    }
}
