// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of a cloud provider that provisioning needs.

use crate::host::{Host, HostId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("cloud provider failed to {operation} for host {host_id}: {message}")]
    Api { host_id: HostId, operation: &'static str, message: String },
}

#[async_trait]
pub trait CloudManager: Send + Sync {
    /// The host's public DNS name.  Empty if the provider has none yet.
    async fn dns_name(&self, host: &Host) -> Result<String, CloudError>;

    /// Called once the host is reachable, before anything is installed.
    async fn on_up(&self, host: &Host) -> Result<(), CloudError>;
}

#[derive(Default)]
struct Inner {
    dns_names: BTreeMap<HostId, String>,
    dns_failure: Option<String>,
    on_up_failure: Option<String>,
    on_up_calls: Vec<HostId>,
}

/// A provider whose answers are fixed up front.
///
/// Used for hosts whose address is already known, and by tests.
#[derive(Default)]
pub struct StaticCloudManager {
    inner: Mutex<Inner>,
}

impl StaticCloudManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dns_name(&self, host_id: &HostId, dns_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .dns_names
            .insert(host_id.clone(), dns_name.to_string());
    }

    pub fn fail_dns(&self, message: Option<&str>) {
        self.inner.lock().unwrap().dns_failure = message.map(str::to_string);
    }

    pub fn fail_on_up(&self, message: Option<&str>) {
        self.inner.lock().unwrap().on_up_failure = message.map(str::to_string);
    }

    /// Hosts for which [`CloudManager::on_up`] has been called, in order.
    pub fn on_up_calls(&self) -> Vec<HostId> {
        self.inner.lock().unwrap().on_up_calls.clone()
    }
}

#[async_trait]
impl CloudManager for StaticCloudManager {
    async fn dns_name(&self, host: &Host) -> Result<String, CloudError> {
        let inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.dns_failure {
            return Err(CloudError::Api {
                host_id: host.id.clone(),
                operation: "look up DNS name",
                message: message.clone(),
            });
        }
        Ok(inner.dns_names.get(&host.id).cloned().unwrap_or_default())
    }

    async fn on_up(&self, host: &Host) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.on_up_calls.push(host.id.clone());
        if let Some(message) = &inner.on_up_failure {
            return Err(CloudError::Api {
                host_id: host.id.clone(),
                operation: "run on-up callback",
                message: message.clone(),
            });
        }
        Ok(())
    }
}
