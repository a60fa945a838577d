// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{CommandFailureInfo, ExecutionError};

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

pub type Output = std::process::Output;

/// Builders for canned outputs, mostly for [crate::FakeExecutor] handlers.
pub trait OutputExt: Sized {
    fn success() -> Self;
    fn failure() -> Self;
    fn set_stdout<S: AsRef<str>>(self, stdout: S) -> Self;
    fn set_stderr<S: AsRef<str>>(self, stderr: S) -> Self;
}

impl OutputExt for Output {
    fn success() -> Self {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: vec![],
            stderr: vec![],
        }
    }

    fn failure() -> Self {
        // Raw wait statuses carry the exit code in the second byte.
        Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: vec![],
            stderr: vec![],
        }
    }

    fn set_stdout<S: AsRef<str>>(mut self, stdout: S) -> Self {
        self.stdout = stdout.as_ref().as_bytes().to_vec();
        self
    }

    fn set_stderr<S: AsRef<str>>(mut self, stderr: S) -> Self {
        self.stderr = stderr.as_ref().as_bytes().to_vec();
        self
    }
}

/// Folds stderr into stdout, the way the host executor captures them.
pub(crate) fn merge_streams(mut output: Output) -> Output {
    let stderr = std::mem::take(&mut output.stderr);
    output.stdout.extend_from_slice(&stderr);
    output
}

pub(crate) fn output_to_exec_error(
    command_str: String,
    output: &Output,
) -> ExecutionError {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_str,
        status: output.status,
        output: combined,
    }))
}
