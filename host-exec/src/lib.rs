// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded execution of local and SSH-tunnelled commands.
//!
//! Every command runs under a [`Deadline`] and has its stdout and stderr
//! merged into a single [`CappedBuffer`].  The executor never retries; that
//! decision belongs to callers.

mod capped;
mod deadline;
mod error;
mod executor;
mod input;
mod output;
mod remote;

pub use capped::CappedBuffer;
pub use capped::DEFAULT_MAX_OUTPUT_BYTES;
pub use deadline::Deadline;
pub use deadline::Elapsed;
pub use deadline::Timeout;
pub use error::CommandFailureInfo;
pub use error::ExecutionError;
pub use executor::BoxedExecutor;
pub use executor::BoxedWaitFn;
pub use executor::CommandSequence;
pub use executor::ExecutedCommand;
pub use executor::Executor;
pub use executor::FakeExecutor;
pub use executor::HostExecutor;
pub use input::Input;
pub use output::Output;
pub use output::OutputExt;
pub use remote::scp_args;
pub use remote::shell_quote;
pub use remote::RemoteCommand;
pub use remote::SshTarget;
