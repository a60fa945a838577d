// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use futures::Future;
use futures::TryFutureExt;
use std::time::Duration;
use tokio::time::Instant;

/// How long a single remote operation may run before it is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Lightweight shell setup on the host (mkdir, profile edits).
    RemoteShellSetup,
    /// Credential writes and file copies.
    FileTransfer,
    /// Fetching a binary onto the host.
    BinaryDownload,
    /// Pulling a task's source and artifacts onto the host.
    ArtifactFetch,
    /// Running the deployed client's host setup.
    RemoteSetup,
    Custom(Duration),
}

impl Deadline {
    pub const fn duration(self) -> Duration {
        match self {
            Deadline::RemoteShellSetup => Duration::from_secs(30),
            Deadline::FileTransfer => Duration::from_secs(60),
            Deadline::BinaryDownload => Duration::from_secs(120),
            Deadline::ArtifactFetch => Duration::from_secs(15 * 60),
            Deadline::RemoteSetup => Duration::from_secs(15 * 60),
            Deadline::Custom(duration) => duration,
        }
    }

    /// Starts the clock on this deadline.
    pub fn start(self) -> Timeout {
        Timeout::from_now(self.duration())
    }
}

impl std::fmt::Display for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Deadline::RemoteShellSetup => "remote shell setup",
            Deadline::FileTransfer => "file transfer",
            Deadline::BinaryDownload => "binary download",
            Deadline::ArtifactFetch => "artifact fetch",
            Deadline::RemoteSetup => "remote setup",
            Deadline::Custom(_) => "custom",
        };
        write!(f, "{} ({}s)", name, self.duration().as_secs_f64())
    }
}

/// Returned by [Timeout::timeout_at] when the clock ran out first.
#[derive(Debug, Clone, Copy)]
pub struct Elapsed(pub Timeout);

impl Elapsed {
    pub fn duration(&self) -> Duration {
        self.0.duration
    }
}

/// A deadline whose clock has started.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    started: Instant,
    duration: Duration,
}

impl Timeout {
    pub fn from_now(duration: Duration) -> Self {
        Self { started: Instant::now(), duration }
    }

    pub fn expires_at(&self) -> Instant {
        self.started + self.duration
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Races `future` against the remaining time.
    pub fn timeout_at<F>(
        self,
        future: F,
    ) -> impl Future<Output = Result<F::Output, Elapsed>>
    where
        F: Future,
    {
        tokio::time::timeout_at(self.expires_at(), future)
            .map_err(move |_| Elapsed(self))
    }
}
