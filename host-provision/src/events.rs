// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Audit events recorded against hosts.

use crate::host::HostId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use slog::{info, o, Logger};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostEventKind {
    /// One provisioning attempt failed; more may follow.
    ProvisionError,
    /// Provisioning gave up.  `logs` holds remote output, if any.
    ProvisionFailed { logs: String },
    Provisioned,
}

#[derive(Clone, Debug, Serialize)]
pub struct HostEvent {
    pub host_id: HostId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: HostEventKind,
}

impl HostEvent {
    pub fn now(host_id: &HostId, kind: HostEventKind) -> Self {
        Self { host_id: host_id.clone(), timestamp: Utc::now(), kind }
    }
}

/// Sink for host audit events.  Recording never fails the caller.
pub trait EventLog: Send + Sync {
    fn record(&self, event: HostEvent);
}

/// Writes events to a logger.
pub struct SlogEventLog {
    log: Logger,
}

impl SlogEventLog {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "EventLog")) }
    }
}

impl EventLog for SlogEventLog {
    fn record(&self, event: HostEvent) {
        let kind = match &event.kind {
            HostEventKind::ProvisionError => "provision-error",
            HostEventKind::ProvisionFailed { .. } => "provision-failed",
            HostEventKind::Provisioned => "provisioned",
        };
        let logs = match &event.kind {
            HostEventKind::ProvisionFailed { logs } => logs.as_str(),
            _ => "",
        };
        info!(
            self.log,
            "host event";
            "host_id" => %event.host_id,
            "event" => kind,
            "timestamp" => %event.timestamp,
            "logs" => logs,
        );
    }
}

/// Keeps events for inspection.
#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<Vec<HostEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self, host_id: &HostId) -> Vec<HostEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| &event.host_id == host_id)
            .map(|event| event.kind.clone())
            .collect()
    }

    /// Number of "provisioning failed" events for `host_id`.
    pub fn failures(&self, host_id: &HostId) -> usize {
        self.kinds(host_id)
            .iter()
            .filter(|kind| matches!(kind, HostEventKind::ProvisionFailed { .. }))
            .count()
    }
}

impl EventLog for InMemoryEventLog {
    fn record(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }
}
