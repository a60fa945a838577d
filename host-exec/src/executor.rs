// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::capped::{CappedBuffer, DEFAULT_MAX_OUTPUT_BYTES};
use crate::deadline::Deadline;
use crate::error::ExecutionError;
use crate::input::Input;
use crate::output::{merge_streams, output_to_exec_error, Output, OutputExt};

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, error, info, warn, Logger};
use std::process::{Command, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn to_space_separated_string<T, I>(iter: T) -> String
where
    T: IntoIterator<Item = I>,
    I: std::fmt::Debug,
{
    Itertools::intersperse(
        iter.into_iter().map(|arg| format!("{arg:?}")),
        " ".into(),
    )
    .collect::<String>()
}

fn log_input(log: &Logger, id: u64, command: &Command, deadline: Deadline) {
    info!(
        log,
        "executing command";
        "id" => id,
        "command" => %Input::from(command),
        "deadline" => %deadline,
    );
    debug!(
        log,
        "executing command";
        "id" => id,
        "envs" => %to_space_separated_string(command.get_envs()),
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "command finished";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "command output";
            "id" => id,
            "output" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// A shareable executor handle.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs a command on behalf of the provisioner.
///
/// [HostExecutor] spawns real processes; tests use [FakeExecutor].
///
/// On success the returned [Output] carries stdout and stderr merged into
/// `stdout`.  Executors never retry.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a command, waiting at most `deadline` for it to complete.
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        deadline: Deadline,
    ) -> Result<Output, ExecutionError>;
}

/// Runs commands as real child processes of this one.
pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
    max_output_bytes: usize,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Self::with_max_output_bytes(log, DEFAULT_MAX_OUTPUT_BYTES)
    }

    pub fn with_max_output_bytes(
        log: Logger,
        max_output_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0), max_output_bytes })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command, deadline: Deadline) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command, deadline);
        id
    }

    fn finalize(
        &self,
        command_str: String,
        id: u64,
        output: Output,
    ) -> Result<Output, ExecutionError> {
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(command_str, &output));
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        deadline: Deadline,
    ) -> Result<Output, ExecutionError> {
        let id = self.prepare(command.as_std(), deadline);
        let command_str = Input::from(command.as_std()).to_string();

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                error!(self.log, "Could not start program!"; "id" => id);
                ExecutionError::ExecutionStart {
                    command: command_str.clone(),
                    err,
                }
            })?;

        let capture = CappedBuffer::new(self.max_output_bytes);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (out, err) = tokio::join!(
                async {
                    match stdout {
                        Some(stdout) => capture.fill_from(stdout).await,
                        None => Ok(()),
                    }
                },
                async {
                    match stderr {
                        Some(stderr) => capture.fill_from(stderr).await,
                        None => Ok(()),
                    }
                },
            );
            out?;
            err?;
            child.wait().await
        };

        let result = deadline.start().timeout_at(run).await;
        match result {
            Ok(Ok(status)) => {
                let output =
                    Output { status, stdout: capture.contents(), stderr: vec![] };
                if capture.is_truncated() {
                    debug!(
                        self.log,
                        "command output truncated";
                        "id" => id,
                        "dropped_bytes" => capture.dropped(),
                    );
                }
                self.finalize(command_str, id, output)
            }
            Ok(Err(err)) => {
                Err(ExecutionError::Capture { command: command_str, err })
            }
            Err(elapsed) => {
                warn!(
                    self.log,
                    "command exceeded its deadline; killing it";
                    "id" => id,
                    "deadline" => %deadline,
                );
                if let Err(err) = child.start_kill() {
                    warn!(
                        self.log,
                        "failed to kill timed out command";
                        "id" => id,
                        "error" => %err,
                    );
                }
                Err(ExecutionError::Timeout {
                    command: command_str,
                    deadline: elapsed.duration(),
                    output: capture.to_string_lossy(),
                })
            }
        }
    }
}

/// Handler called when a fake command "runs".
pub type WaitFn = dyn FnMut(&Input, Deadline) -> Output + Send + Sync;
pub type BoxedWaitFn = Box<WaitFn>;

/// A command observed by a [FakeExecutor].
#[derive(Clone, Debug)]
pub struct ExecutedCommand {
    pub id: u64,
    pub input: Input,
    pub deadline: Deadline,
}

/// Answers commands from a handler instead of spawning them.
///
/// The default handler succeeds with empty output.  Every command is
/// recorded along with its deadline, see [Self::executed].
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    wait_handler: Mutex<BoxedWaitFn>,
    history: Mutex<Vec<ExecutedCommand>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            wait_handler: Mutex::new(Box::new(|_input, _deadline| {
                Output::success()
            })),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the handler that produces each command's output.
    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.wait_handler.lock().unwrap() = f;
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    /// All commands run so far, in order.
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.history.lock().unwrap().clone()
    }

    fn execute_internal(
        &self,
        command: &Command,
        deadline: Deadline,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command, deadline);

        let input = Input::from(command);
        self.history.lock().unwrap().push(ExecutedCommand {
            id,
            input: input.clone(),
            deadline,
        });

        let output =
            merge_streams(self.wait_handler.lock().unwrap()(&input, deadline));
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(input.to_string(), &output));
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    // The handler is synchronous; nothing here awaits.
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        deadline: Deadline,
    ) -> Result<Output, ExecutionError> {
        self.execute_internal(command.as_std(), deadline)
    }
}

type DynamicHandler = Box<dyn FnMut(Input) -> Output + Send + Sync>;

enum Step {
    Exact { input: Input, output: Output },
    Check { handler: DynamicHandler },
}

/// A script of the commands a test expects, in order.
///
/// Install it on a [FakeExecutor] with [Self::register].  Running a command
/// past the end of the script panics, and so does dropping a sequence whose
/// steps were not all consumed.
pub struct CommandSequence {
    steps: Vec<Step>,
    next: usize,
}

impl Default for CommandSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSequence {
    pub fn new() -> Self {
        Self { steps: Vec::new(), next: 0 }
    }

    /// Makes this sequence answer every command `executor` runs.
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_wait_handler(Box::new(move |input, _deadline| {
            self.answer(input)
        }));
    }

    /// The next command must equal `input`; it produces `output`.
    pub fn expect(&mut self, input: Input, output: Output) {
        self.steps.push(Step::Exact { input, output });
    }

    /// The next command must be `command` (split like a shell would) and
    /// succeeds with no output.
    pub fn expect_ok<S: AsRef<str>>(&mut self, command: S) {
        self.expect(Input::shell(command), Output::success())
    }

    /// Like [Self::expect_ok], but the command fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, command: S) {
        self.expect(Input::shell(command), Output::failure())
    }

    /// The next command, whatever it is, goes to `handler`, which may
    /// assert on it and picks the output.
    pub fn expect_dynamic(&mut self, handler: DynamicHandler) {
        self.steps.push(Step::Check { handler });
    }

    fn answer(&mut self, observed: &Input) -> Output {
        let Some(step) = self.steps.get_mut(self.next) else {
            panic!("command ran after the sequence ended: {observed}");
        };
        self.next += 1;

        match step {
            Step::Exact { input, output } => {
                assert_eq!(observed, input, "command out of sequence");
                output.clone()
            }
            Step::Check { handler } => handler(observed.clone()),
        }
    }
}

impl Drop for CommandSequence {
    fn drop(&mut self) {
        if self.next >= self.steps.len() {
            return;
        }
        let pending = match &self.steps[self.next] {
            Step::Exact { input, .. } => input.to_string(),
            Step::Check { .. } => "<dynamic handler>".to_string(),
        };
        let message = format!(
            "sequence ended after {} of {} commands; next expected: {pending}",
            self.next,
            self.steps.len(),
        );
        // Panicking while already unwinding would abort the test binary.
        if std::thread::panicking() {
            eprintln!("{message}");
        } else {
            panic!("{message}");
        }
    }
}
