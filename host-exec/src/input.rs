// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::process::Command;

/// A command line captured as plain strings, for logging and comparison.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Input {
    pub program: String,
    pub args: VecDeque<String>,
    pub envs: Vec<(String, String)>,
}

impl Input {
    pub fn new<S: Into<String>>(program: S, args: Vec<S>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|s| s.into()).collect(),
            envs: vec![],
        }
    }

    /// Splits `line` with shell quoting rules.  Panics on unbalanced quotes
    /// or an empty line; meant for test expectations.
    pub fn shell<S: AsRef<str>>(line: S) -> Self {
        let line = line.as_ref();
        let words = shlex::split(line)
            .unwrap_or_else(|| panic!("unbalanced quoting in {line:?}"));
        let mut words = words.into_iter();
        let Some(program) = words.next() else {
            panic!("no program in {line:?}");
        };
        Self::new(program, words.collect())
    }

    /// The final argument, which for SSH invocations is the remote command
    /// line.
    pub fn last_arg(&self) -> Option<&str> {
        self.args.back().map(String::as_str)
    }

    /// Returns true if the program or any argument contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.program.contains(needle)
            || self.args.iter().any(|arg| arg.contains(needle))
    }
}

fn quote_for_display(s: &str) -> String {
    shlex::try_quote(s)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| format!("{s:?}"))
}

impl std::fmt::Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", quote_for_display(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote_for_display(arg))?;
        }
        Ok(())
    }
}

fn lossy(s: &std::ffi::OsStr) -> String {
    s.to_string_lossy().into_owned()
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Self {
            program: lossy(command.get_program()),
            args: command.get_args().map(lossy).collect(),
            envs: command
                .get_envs()
                .map(|(k, v)| (lossy(k), v.map(lossy).unwrap_or_default()))
                .collect(),
        }
    }
}
