// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building local and SSH-redirected command lines.

use crate::deadline::Deadline;
use crate::error::ExecutionError;
use crate::executor::Executor;

pub const SSH: &str = "ssh";
pub const SCP: &str = "scp";

/// Where and as whom a remote command runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub hostname: String,
    pub user: String,
    pub port: u16,
}

impl SshTarget {
    /// The `user@host` form understood by ssh and scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.hostname, self.port)
    }
}

/// Quotes `s` so that a POSIX shell reads it back as a single word.
pub fn shell_quote(s: &str) -> Result<String, ExecutionError> {
    shlex::try_quote(s)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| ExecutionError::Quote { arg: s.to_string() })
}

/// Arguments for copying local `src` to `dst` on `target`.
pub fn scp_args(
    src: &str,
    dst: &str,
    target: &SshTarget,
    opts: &[String],
) -> Vec<String> {
    let mut args =
        vec![SCP.to_string(), "-P".to_string(), target.port.to_string()];
    args.extend(opts.iter().cloned());
    args.push(src.to_string());
    args.push(format!("{}:{}", target.destination(), dst));
    args
}

#[derive(Clone, Debug)]
enum CommandLine {
    /// A program and its arguments, one word each.
    Args(Vec<String>),
    /// A command line passed through to a shell verbatim.
    Literal(String),
}

/// Builder for one command, run either locally or on a remote host over ssh.
///
/// Without a host, a single [`RemoteCommand::add`] runs the program
/// directly and anything else runs under `sh -c`.  With a host, every
/// appended piece becomes part of one remote command line, chained with
/// `&&`.
#[derive(Clone, Debug, Default)]
pub struct RemoteCommand {
    host: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    remote_args: Vec<String>,
    commands: Vec<CommandLine>,
}

impl RemoteCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Shorthand for [Self::host], [Self::user] and [Self::port].
    pub fn target(self, target: &SshTarget) -> Self {
        self.host(target.hostname.clone())
            .user(target.user.clone())
            .port(target.port)
    }

    /// Extra arguments handed to the ssh transport itself.
    pub fn extend_remote_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends a program and its arguments.
    pub fn add<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands
            .push(CommandLine::Args(args.into_iter().map(Into::into).collect()));
        self
    }

    /// Appends a literal command line.
    pub fn append(mut self, line: impl Into<String>) -> Self {
        self.commands.push(CommandLine::Literal(line.into()));
        self
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    fn joined(&self) -> Result<String, ExecutionError> {
        let mut lines = Vec::with_capacity(self.commands.len());
        for command in &self.commands {
            match command {
                CommandLine::Args(args) => {
                    let quoted = args
                        .iter()
                        .map(|arg| shell_quote(arg))
                        .collect::<Result<Vec<_>, _>>()?;
                    lines.push(quoted.join(" "));
                }
                CommandLine::Literal(line) => lines.push(line.clone()),
            }
        }
        Ok(lines.join(" && "))
    }

    /// Produces the process to spawn.
    pub fn to_command(
        &self,
    ) -> Result<tokio::process::Command, ExecutionError> {
        if self.commands.is_empty() {
            return Err(ExecutionError::EmptyCommand);
        }

        if let Some(host) = &self.host {
            let mut command = tokio::process::Command::new(SSH);
            if let Some(port) = self.port {
                command.arg("-p").arg(port.to_string());
            }
            command.args(&self.remote_args);
            match &self.user {
                Some(user) => command.arg(format!("{user}@{host}")),
                None => command.arg(host),
            };
            command.arg(self.joined()?);
            return Ok(command);
        }

        match self.commands.as_slice() {
            [CommandLine::Args(args)] => {
                let (program, rest) =
                    args.split_first().ok_or(ExecutionError::EmptyCommand)?;
                let mut command = tokio::process::Command::new(program);
                command.args(rest);
                Ok(command)
            }
            _ => {
                let mut command = tokio::process::Command::new("sh");
                command.arg("-c").arg(self.joined()?);
                Ok(command)
            }
        }
    }

    /// Runs the command under `deadline`, returning its captured output.
    ///
    /// On failure the error carries whatever output was captured.
    pub async fn run(
        &self,
        executor: &dyn Executor,
        deadline: Deadline,
    ) -> Result<String, ExecutionError> {
        let mut command = self.to_command()?;
        let output = executor.execute(&mut command, deadline).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
