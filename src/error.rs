use std::io;
use thiserror::Error;

/// Errors surfaced by the fork-server session.
///
/// Everything here is fatal to the session. A fork-server whose transport or
/// sandboxing primitives failed half way cannot be trusted to spawn further
/// workers, so there is no retry path: the controller discards the handle and
/// starts a fresh fork-server.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure on the controller connection: short read mid
    /// message, partial length prefix or a write that could not complete.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent a well formed message that does not fit the protocol at
    /// this point of the session, or closed the connection mid exchange.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A module named in the import directive failed to load. The fork-server
    /// must not accept spawn requests after this.
    #[error("failed to import module {0}")]
    Import(String, #[source] anyhow::Error),

    /// The configured entry function reference could not be resolved at
    /// fork-server startup.
    #[error("failed to resolve entry function {0}")]
    ResolveEntry(String, #[source] anyhow::Error),

    /// Any other failure, typically a failed OS call while spawning.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}
