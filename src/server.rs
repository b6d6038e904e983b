//! The fork-server process.
//!
//! Deliberately kept to a minimal surface of live state: the imported
//! modules, the resolved entry function and the session channel. Anything
//! reachable from this process is reachable from the workers it spawns.

use crate::{
    error::Error,
    ipc::FramedUnixStream,
    loader::{EntryFn, ModuleLoader},
    protocol::{Message, Pid, SpawnRequest},
    sandbox, trampoline,
    trampoline::WorkerContext,
    util,
};
use anyhow::Context;
use log::{debug, warn};
use nix::{
    libc,
    sys::signal::{signal, SigHandler, Signal},
    unistd::{self, ForkResult},
};
use std::{
    io::{self, Write},
    os::unix::{
        net::UnixStream,
        prelude::{AsRawFd, FromRawFd, RawFd},
    },
    process::exit,
};

/// Fork the fork-server process.
///
/// Returns the fork-server pid and the controller's end of the session
/// stream. The child never returns from here: it runs [`run`] and exits with
/// 0 on a clean session shutdown or 1 on a session-fatal error.
pub fn start<L: ModuleLoader>(loader: &L, entry_ref: &str) -> Result<(Pid, UnixStream), Error> {
    let (first, second) = UnixStream::pair().context("failed to create socket pair")?;

    match unsafe { unistd::fork().context("failed to fork")? } {
        ForkResult::Parent { child } => {
            drop(second);
            Ok((child.as_raw() as Pid, first))
        }
        ForkResult::Child => {
            drop(first);

            util::set_parent_death_signal(Signal::SIGKILL)
                .expect("failed to set parent death signal");
            util::set_process_name("forkserver").expect("failed to set process name");

            // Terminal signals are the controller's business, not ours. The
            // session ends when the controller closes its end.
            unsafe {
                signal(Signal::SIGINT, SigHandler::SigIgn).expect("failed to ignore SIGINT");
                signal(Signal::SIGHUP, SigHandler::SigIgn).expect("failed to ignore SIGHUP");
            }

            let code = match run(second, loader, entry_ref) {
                Ok(()) => 0,
                Err(error) => {
                    let _ = writeln!(io::stderr(), "forkserver: {error}");
                    1
                }
            };
            exit(code);
        }
    }
}

/// Run the fork-server main loop on a session stream.
///
/// States: Starting (close stdin, resolve the entry function) →
/// ImportingModules (exactly one import directive, failure fatal) →
/// AwaitingRequest ⇄ Spawning → Closed. A clean peer close in
/// AwaitingRequest is the only non-error exit.
pub fn run<L: ModuleLoader>(
    stream: UnixStream,
    loader: &L,
    entry_ref: &str,
) -> Result<(), Error> {
    // Neither the fork-server nor any worker may read operator stdin.
    let _ = unistd::close(libc::STDIN_FILENO);

    let entry = loader
        .resolve(entry_ref)
        .map_err(|e| Error::ResolveEntry(entry_ref.into(), e))?;

    let mut channel = FramedUnixStream::new(stream);

    match channel.recv()? {
        Some(Message::ImportRequest { modules }) => {
            for module in &modules {
                debug!("Importing module {module}");
                loader
                    .import(module)
                    .map_err(|e| Error::Import(module.clone(), e))?;
            }
        }
        Some(message) => {
            return Err(Error::Protocol(format!(
                "expected import directive, got {message:?}"
            )))
        }
        None => {
            return Err(Error::Protocol(
                "connection closed before import directive".into(),
            ))
        }
    }

    debug!("Entering main loop");

    loop {
        let request = match channel.recv()? {
            Some(Message::SpawnRequest { request }) => request,
            Some(message) => {
                return Err(Error::Protocol(format!(
                    "expected spawn request, got {message:?}"
                )))
            }
            None => {
                debug!("Connection closed. Exiting...");
                return Ok(());
            }
        };

        spawn(&mut channel, entry, &request)?;
    }
}

/// Adapt a pre-connected stream fd into a running fork-server.
///
/// This is the exec-style launch interface: a launcher that starts the
/// fork-server as a fresh program hands over the entry function reference
/// and the fd number of the session stream.
///
/// # Safety
///
/// `socket_fd` must be an open, connected unix stream socket owned by the
/// caller and not used elsewhere after this call.
pub unsafe fn run_from_fd<L: ModuleLoader>(
    socket_fd: RawFd,
    loader: &L,
    entry_ref: &str,
) -> Result<(), Error> {
    let stream = UnixStream::from_raw_fd(socket_fd);
    run(stream, loader, entry_ref)
}

/// Create one sandboxed worker and report it on the session channel.
///
/// Any failure in here is session-fatal: a failed spawn leaves no safely
/// reusable fork-server state.
fn spawn(
    channel: &mut FramedUnixStream,
    entry: EntryFn,
    request: &SpawnRequest,
) -> Result<(), Error> {
    if !request.skip_layers.is_empty() && !cfg!(any(test, feature = "test-overrides")) {
        warn!(
            "Ignoring sandbox overrides of {} in production build",
            request.process_label
        );
    }

    let (stdout_read, stdout_write) = unistd::pipe().context("failed to create stdout pipe")?;
    let (stderr_read, stderr_write) = unistd::pipe().context("failed to create stderr pipe")?;
    let (sync_read, sync_write) = unistd::pipe().context("failed to create sync pipe")?;

    let ctx = WorkerContext {
        entry,
        request,
        session_fd: channel.as_raw_fd(),
        stdout_read: stdout_read.as_raw_fd(),
        stdout_write: stdout_write.as_raw_fd(),
        stderr_read: stderr_read.as_raw_fd(),
        stderr_write: stderr_write.as_raw_fd(),
        sync_read: sync_read.as_raw_fd(),
        sync_write: sync_write.as_raw_fd(),
    };

    let pid = trampoline::spawn(&ctx)?;
    debug!("Created worker {} with pid {}", request.process_label, pid);

    // The worker owns its copies of the write ends now.
    drop(stdout_write);
    drop(stderr_write);

    // The id maps must be written from outside the new namespace. The worker
    // blocks on the sync pipe until we are done; closing our write end
    // releases it.
    drop(sync_read);
    sandbox::write_id_maps(pid)?;
    drop(sync_write);

    let result = Message::SpawnResult {
        pid,
        stdout_fd: stdout_read.as_raw_fd(),
        stderr_fd: stderr_read.as_raw_fd(),
    };
    channel.send(&result)?;

    // Transfer descriptor ownership to the controller, then discard our
    // copies.
    let captured = [stdout_read, stderr_read];
    channel.send_fds(&captured)?;
    drop(captured);

    Ok(())
}
