//! A fork-server for spawning sandboxed worker processes.
//!
//! Three processes cooperate:
//!
//! * The *controller* holds a connection to a fork-server instance. It sends
//!   spawn requests and receives back a pid plus the read ends of the
//!   worker's captured stdout and stderr. It is responsible for reaping the
//!   worker and for enforcing any execution timeout.
//! * The *fork-server* is started once per controller connection. It imports
//!   every module the workers will need (imports may require privileges the
//!   workers no longer have), then loops: receive a spawn request, clone an
//!   isolated worker, report the worker's pid, repeat.
//! * The *worker* executes the untrusted entry function. It is created in a
//!   fresh user namespace as a direct child of the controller, with all
//!   capabilities dropped and its output redirected into the captured pipes.

#![deny(missing_docs)]
#![deny(
    clippy::all,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::unwrap_used
)]

/// Controller side handle to a running fork-server.
pub mod controller;

/// Session error taxonomy.
pub mod error;

/// Worker exit status and well known exit codes.
pub mod exit_status;

/// Framed message transport with file descriptor passing.
pub mod ipc;

/// Module loading and entry function resolution boundary.
pub mod loader;

/// Wire messages exchanged between controller and fork-server.
pub mod protocol;

/// Sandbox layers applied to every worker.
pub mod sandbox;

/// Fork-server process: startup and main loop.
pub mod server;

mod trampoline;
mod util;
mod worker;

pub use controller::{ForkServer, SpawnedWorker};
pub use error::Error;
pub use exit_status::ExitStatus;
pub use loader::{EntryFn, ModuleLoader, Registry};
pub use protocol::{Pid, SandboxLayer, SpawnRequest, Value};
