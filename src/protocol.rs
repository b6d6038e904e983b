use serde::{Deserialize, Serialize};
use std::{collections::HashSet, os::unix::prelude::RawFd, path::PathBuf};

/// Process id reported for spawned workers.
pub type Pid = u32;

/// Argument value passed verbatim to the worker entry function.
///
/// Arguments cross the process boundary in serialized form, so they are
/// restricted to this self describing set rather than arbitrary host types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
}

/// A sandbox layer that can be skipped through the test-only override set.
///
/// Only the privilege layers are listed here. The structural layers (closing
/// the session socket, closing the fork-server's pipe ends, the id-map
/// rendezvous and the output redirection) cannot be skipped: without them the
/// worker cannot uphold the protocol at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxLayer {
    /// `PR_SET_NO_NEW_PRIVS`: prevent setuid binaries from regaining dropped
    /// capabilities.
    NoNewPrivs,
    /// Clear the effective and permitted capability sets.
    DropCapabilities,
    /// Reserved: descend to an unprivileged uid/gid.
    DescendIds,
    /// Reserved: confine the filesystem view via chroot.
    ConfineRoot,
}

/// Immutable description of one worker to create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Short descriptive name, shown in the OS process list.
    pub process_label: String,
    /// Arguments passed verbatim to the worker entry function.
    pub args: Vec<Value>,
    /// Mount root the worker should be confined to. Advisory: the chroot
    /// layer is reserved and not applied by default.
    pub isolation_root: Option<PathBuf>,
    /// Sandbox layers to skip. Must be empty in production; non-empty sets
    /// are honored only in test builds and ignored (with a warning)
    /// everywhere else.
    pub skip_layers: HashSet<SandboxLayer>,
}

impl SpawnRequest {
    /// Create a request with all sandbox layers enabled.
    pub fn new(process_label: impl Into<String>, args: Vec<Value>) -> SpawnRequest {
        SpawnRequest {
            process_label: process_label.into(),
            args,
            isolation_root: None,
            skip_layers: HashSet::new(),
        }
    }

    /// Skip a sandbox layer. Test-only escape hatch: release builds apply
    /// every layer regardless of this set.
    pub fn skip_layer(mut self, layer: SandboxLayer) -> SpawnRequest {
        self.skip_layers.insert(layer);
        self
    }
}

/// Messages between the controller and the fork-server process.
///
/// Session order: exactly one `ImportRequest` immediately after connect, then
/// zero or more `SpawnRequest`/`SpawnResult` pairs. The session ends when the
/// controller closes its end of the connection.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Modules the fork-server must load before entering its main loop.
    /// Anything imported here is visible to every spawned worker, so the
    /// list must exclude anything holding secrets.
    ImportRequest {
        /// Module names passed to the [`crate::ModuleLoader`].
        modules: Vec<String>,
    },
    /// Request to spawn one sandboxed worker.
    SpawnRequest {
        /// The worker description.
        request: SpawnRequest,
    },
    /// Identity of a freshly spawned worker. The fd fields are the sender's
    /// descriptor numbers and are meaningless to the receiver: the live
    /// descriptors travel via `SCM_RIGHTS` right after this message, and the
    /// receiver substitutes its own resolved numbers.
    SpawnResult {
        /// Pid of the worker. The worker is a direct child of the controller
        /// and must be reaped by it.
        pid: Pid,
        /// Placeholder for the read end of the worker's captured stdout.
        stdout_fd: RawFd,
        /// Placeholder for the read end of the worker's captured stderr.
        stderr_fd: RawFd,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::ipc::FramedUnixStream;
    use std::os::unix::net::UnixStream;

    #[test]
    fn spawn_request_roundtrip() {
        let request = SpawnRequest {
            process_label: "worker-1".into(),
            args: vec![
                Value::Int(2),
                Value::Float(0.5),
                Value::Text("x".into()),
                Value::List(vec![Value::Null, Value::Bool(true)]),
                Value::Bytes(vec![0, 1, 2]),
            ],
            isolation_root: Some("/var/lib/sandbox".into()),
            skip_layers: HashSet::new(),
        };

        let (first, second) = UnixStream::pair().unwrap();
        let mut tx = FramedUnixStream::new(first);
        let mut rx = FramedUnixStream::new(second);

        tx.send(Message::SpawnRequest {
            request: request.clone(),
        })
        .unwrap();

        match rx.recv::<Message>().unwrap().unwrap() {
            Message::SpawnRequest { request: received } => assert_eq!(received, request),
            message => panic!("unexpected message: {message:?}"),
        }
    }

    #[test]
    fn import_request_roundtrip() {
        let (first, second) = UnixStream::pair().unwrap();
        let mut tx = FramedUnixStream::new(first);
        let mut rx = FramedUnixStream::new(second);

        let modules = vec!["math_helpers".to_string(), "formatters".to_string()];
        tx.send(Message::ImportRequest {
            modules: modules.clone(),
        })
        .unwrap();

        assert_eq!(
            rx.recv::<Message>().unwrap().unwrap(),
            Message::ImportRequest { modules }
        );
    }
}
