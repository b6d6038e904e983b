use crate::{
    error::Error,
    exit_status::ExitStatus,
    ipc::FramedUnixStream,
    loader::ModuleLoader,
    protocol::{Message, Pid, SpawnRequest},
    server,
};
use anyhow::Context;
use log::debug;
use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd,
};
use std::os::unix::prelude::OwnedFd;

/// Controller-side handle to a fork-server process.
///
/// The handle owns the session stream exclusively. Dropping or shutting it
/// down closes the stream, which the fork-server observes as the shutdown
/// signal. The protocol is synchronous: one request, one response, before
/// the next request is read.
#[derive(Debug)]
pub struct ForkServer {
    pid: Pid,
    channel: FramedUnixStream,
}

impl ForkServer {
    /// Start a fork-server whose workers run the entry function named by
    /// `entry_ref`, resolved through `loader`.
    pub fn start<L: ModuleLoader>(loader: &L, entry_ref: &str) -> Result<ForkServer, Error> {
        let (pid, stream) = server::start(loader, entry_ref)?;
        debug!("Started fork-server with pid {pid}");
        Ok(ForkServer {
            pid,
            channel: FramedUnixStream::new(stream),
        })
    }

    /// Pid of the fork-server process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send the import directive. Must be called exactly once, before the
    /// first spawn. Whatever is imported is visible to every subsequently
    /// spawned worker, so the list must exclude anything holding secrets.
    ///
    /// There is no acknowledgement; an import failure is fatal to the
    /// fork-server and surfaces as a closed session on the next spawn.
    pub fn import_modules(&mut self, modules: Vec<String>) -> Result<(), Error> {
        self.channel.send(&Message::ImportRequest { modules })?;
        Ok(())
    }

    /// Spawn one sandboxed worker.
    ///
    /// The returned worker is a direct child of the calling process, not of
    /// the fork-server. The caller must eventually [`SpawnedWorker::wait`]
    /// on it or the pid stays behind as a zombie; the caller is also the one
    /// to enforce any execution timeout, via [`SpawnedWorker::kill`].
    pub fn spawn(&mut self, request: SpawnRequest) -> Result<SpawnedWorker, Error> {
        self.channel.send(&Message::SpawnRequest { request })?;

        match self.channel.recv()? {
            Some(Message::SpawnResult { pid, .. }) => {
                // The serialized fd numbers are placeholders. Substitute the
                // descriptors resolved by the SCM_RIGHTS transfer.
                let mut fds = self.channel.recv_fds::<OwnedFd, 2>()?;
                let stderr = fds.pop().ok_or_else(|| {
                    Error::Protocol("missing stderr descriptor in spawn result".into())
                })?;
                let stdout = fds.pop().ok_or_else(|| {
                    Error::Protocol("missing stdout descriptor in spawn result".into())
                })?;
                Ok(SpawnedWorker {
                    pid,
                    stdout,
                    stderr,
                })
            }
            Some(message) => Err(Error::Protocol(format!(
                "expected spawn result, got {message:?}"
            ))),
            None => Err(Error::Protocol("session closed during spawn".into())),
        }
    }

    /// Shut the session down and reap the fork-server process.
    pub fn shutdown(self) -> Result<ExitStatus, Error> {
        let ForkServer { pid, channel } = self;
        // Closing our end is the defined shutdown signal.
        drop(channel);
        wait(pid)
    }
}

/// Handle to a spawned worker: its pid and the read ends of its captured
/// stdout and stderr. Reading the streams yields exactly the bytes the
/// worker wrote, nothing else.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Pid of the worker process, a direct child of the controller.
    pub pid: Pid,
    /// Read end of the worker's captured stdout.
    pub stdout: OwnedFd,
    /// Read end of the worker's captured stderr.
    pub stderr: OwnedFd,
}

impl SpawnedWorker {
    /// Reap the worker and return its exit status. Blocks until the worker
    /// terminates.
    pub fn wait(&self) -> Result<ExitStatus, Error> {
        wait(self.pid)
    }

    /// Send a signal to the worker, e.g. to enforce a timeout tracked by the
    /// caller. Complete the kill with [`SpawnedWorker::wait`].
    pub fn kill(&self, signal: Signal) -> Result<(), Error> {
        signal::kill(unistd::Pid::from_raw(self.pid as i32), signal)
            .with_context(|| format!("failed to signal worker {}", self.pid))?;
        Ok(())
    }
}

/// Wait for `pid` to terminate and map the wait status.
fn wait(pid: Pid) -> Result<ExitStatus, Error> {
    loop {
        match waitpid(unistd::Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => break Ok(ExitStatus::Exit(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                break Ok(ExitStatus::Signalled(signal as u8))
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => break Err(Error::Unexpected(
                anyhow::Error::new(e).context(format!("failed to wait for {pid}")),
            )),
        }
    }
}
