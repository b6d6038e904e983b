use crate::{
    error::Error,
    loader::EntryFn,
    protocol::{Pid, SpawnRequest},
    worker,
};
use anyhow::Context;
use nix::{
    libc,
    sched::{self, CloneFlags},
    sys::signal::Signal,
};
use std::os::unix::prelude::RawFd;

/// Stack size of the worker process.
///
/// The kernel hands the new process this pre-allocated region as its stack;
/// there is no growth mechanism underneath, and the entry function may
/// recurse arbitrarily inside untrusted code. 8 MiB matches the common
/// thread stack default; anything below ~1 MiB is asking for trouble.
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Everything the worker needs, established immediately before process
/// creation and consumed exactly once by the trampoline. The clone callback
/// captures this by reference; no process-wide state is involved, so nothing
/// else of the fork-server leaks into the sandboxed child by convention.
///
/// The fd fields are the raw numbers of descriptors owned by the caller.
/// After `clone` the worker holds its own copies and closes or duplicates
/// them as part of sandboxing; the caller's ownership is untouched.
pub(crate) struct WorkerContext<'a> {
    /// Entry function the worker runs after sandboxing.
    pub entry: EntryFn,
    /// The spawn request this worker was created for.
    pub request: &'a SpawnRequest,
    /// Connection to the controller. Closed first inside the worker.
    pub session_fd: RawFd,
    /// Read end of the captured stdout pipe. Closed inside the worker.
    pub stdout_read: RawFd,
    /// Write end of the captured stdout pipe. Becomes the worker's stdout.
    pub stdout_write: RawFd,
    /// Read end of the captured stderr pipe. Closed inside the worker.
    pub stderr_read: RawFd,
    /// Write end of the captured stderr pipe. Becomes the worker's stderr.
    pub stderr_write: RawFd,
    /// Read end of the id-map sync pipe. The worker blocks on it.
    pub sync_read: RawFd,
    /// Write end of the id-map sync pipe. Closed inside the worker.
    pub sync_write: RawFd,
}

/// Create the worker process.
///
/// The new process starts on a fresh stack at [`worker::main`], inherits no
/// call stack state from the fork-server, runs in a new user namespace and,
/// via `CLONE_PARENT`, is a child of the fork-server's parent: the
/// controller reaps it, the fork-server never collects zombies. `SIGCHLD`
/// is delivered to the controller on exit.
///
/// Returns the worker pid in the calling process. The call never returns
/// along this path inside the worker; the worker's whole lifetime is
/// [`worker::main`], whose return value is its exit code.
pub(crate) fn spawn(ctx: &WorkerContext) -> Result<Pid, Error> {
    let mut stack = allocate_stack()?;

    let flags = CloneFlags::CLONE_PARENT | CloneFlags::CLONE_NEWUSER;
    let cb = Box::new(|| worker::main(ctx));

    // Safety: the callback only touches the context and its own state. The
    // fork-server is single threaded, so the address space copy is sane.
    let pid = unsafe { sched::clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as libc::c_int)) }
        .context("clone system call failed")?;

    Ok(pid.as_raw() as Pid)
}

/// Allocate the worker stack with an explicit out-of-memory failure path.
fn allocate_stack() -> Result<Vec<u8>, Error> {
    let mut stack = Vec::new();
    stack
        .try_reserve_exact(WORKER_STACK_SIZE)
        .context("failed to allocate worker stack")?;
    stack.resize(WORKER_STACK_SIZE, 0);
    Ok(stack)
}
