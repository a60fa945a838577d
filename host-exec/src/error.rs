// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::ExitStatus;
use std::time::Duration;

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: ExitStatus,
    /// stdout and stderr of the command, interleaved, possibly truncated.
    pub output: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  output: {}", self.output)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]")]
    ExecutionStart {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error(
        "Command [{command}] did not finish within {}s  output: {output}",
        .deadline.as_secs()
    )]
    Timeout { command: String, deadline: Duration, output: String },

    #[error("Failed to collect output of [{command}]")]
    Capture {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("Cannot quote {arg:?} for a remote shell")]
    Quote { arg: String },

    #[error("No command was provided")]
    EmptyCommand,
}

impl ExecutionError {
    /// Returns whatever output the command produced before failing.
    pub fn output(&self) -> &str {
        match self {
            ExecutionError::CommandFailure(info) => &info.output,
            ExecutionError::Timeout { output, .. } => output,
            _ => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }
}
