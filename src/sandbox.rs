//! Sandbox layers applied inside a freshly cloned worker, plus the
//! server-side identity mapping that pairs with them.
//!
//! The layers run in a fixed order; each step narrows capability further and
//! reordering weakens the guarantees. See [`enter`].

use crate::{error::Error, protocol::SandboxLayer, trampoline::WorkerContext, util};
use anyhow::{anyhow, Context, Result};
use nix::{errno::Errno, libc, unistd};
use std::{collections::HashSet, fs, os::unix::prelude::RawFd, path::Path};

/// First host uid/gid the worker namespace is mapped onto.
pub const ID_MAP_BASE: u32 = 100_000;

/// Number of ids mapped into the worker namespace.
pub const ID_MAP_COUNT: u32 = 65_536;

/// Apply all sandbox layers to the calling (worker) process.
///
/// Order:
///
/// 1. Close the fork-server's session socket. The worker must never be able
///    to speak the fork-server protocol or observe its traffic.
/// 2. Close the fork-server's copies of the captured pipe read ends.
/// 3. Block on the sync pipe until the fork-server has written our uid/gid
///    maps. The maps must be written from outside the new namespace, so the
///    worker must not proceed before that signal.
/// 4. Redirect stdout and stderr onto the captured pipe write ends and close
///    the originals. After this no descriptor refers to the fork-server's
///    own log stream.
/// 5. `PR_SET_NO_NEW_PRIVS`.
/// 6. Clear the effective and permitted capability sets. Even a process that
///    manages to assume a root identity gains no kernel privileges after
///    this.
pub(crate) fn enter(ctx: &WorkerContext) -> Result<()> {
    unistd::close(ctx.session_fd).context("failed to close session socket")?;

    unistd::close(ctx.stdout_read).context("failed to close stdout read end")?;
    unistd::close(ctx.stderr_read).context("failed to close stderr read end")?;

    await_id_map(ctx.sync_read, ctx.sync_write)?;

    redirect_output(ctx.stdout_write, ctx.stderr_write)?;

    if !skipped(SandboxLayer::NoNewPrivs, &ctx.request.skip_layers) {
        util::set_no_new_privs().context("failed to set no new privs")?;
    }

    if !skipped(SandboxLayer::DropCapabilities, &ctx.request.skip_layers) {
        drop_capabilities()?;
    }

    Ok(())
}

/// Should `layer` be skipped for this request? Overrides are a test-only
/// escape hatch: release builds apply every layer no matter what the request
/// says.
fn skipped(layer: SandboxLayer, skip: &HashSet<SandboxLayer>) -> bool {
    if skip.is_empty() {
        return false;
    }
    if cfg!(any(test, feature = "test-overrides")) {
        skip.contains(&layer)
    } else {
        false
    }
}

/// Rendezvous with the fork-server on the sync pipe.
///
/// Close our copy of the write end first, then block until end of file,
/// which the fork-server produces by closing its write end after the id maps
/// are written. No polling, no timer: the wait resolves on a peer action.
fn await_id_map(sync_read: RawFd, sync_write: RawFd) -> Result<()> {
    unistd::close(sync_write).context("failed to close sync pipe write end")?;

    let mut buf = [0u8; 1];
    loop {
        match unistd::read(sync_read, &mut buf) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("failed to read sync pipe"),
        }
    }

    unistd::close(sync_read).context("failed to close sync pipe read end")
}

/// Duplicate the captured pipe write ends onto stdout and stderr and close
/// the originals.
fn redirect_output(stdout_write: RawFd, stderr_write: RawFd) -> Result<()> {
    unistd::dup2(stdout_write, libc::STDOUT_FILENO).context("failed to redirect stdout")?;
    unistd::dup2(stderr_write, libc::STDERR_FILENO).context("failed to redirect stderr")?;
    unistd::close(stdout_write).context("failed to close stdout write end")?;
    unistd::close(stderr_write).context("failed to close stderr write end")?;
    Ok(())
}

/// Clear the effective and permitted capability sets of the calling process.
fn drop_capabilities() -> Result<()> {
    caps::clear(None, caps::CapSet::Effective)
        .map_err(|e| anyhow!("failed to clear effective capabilities: {e}"))?;
    caps::clear(None, caps::CapSet::Permitted)
        .map_err(|e| anyhow!("failed to clear permitted capabilities: {e}"))?;
    Ok(())
}

/// Write the worker's uid/gid maps from outside its namespace.
///
/// Root inside the worker namespace maps to the unprivileged host range
/// starting at [`ID_MAP_BASE`]; subordinate group assignment is explicitly
/// disabled. Must be called by the fork-server after the trampoline returned
/// a valid pid and before the sync pipe write end is closed.
pub(crate) fn write_id_maps(pid: crate::protocol::Pid) -> Result<()> {
    let map = format!("0 {ID_MAP_BASE} {ID_MAP_COUNT}");
    fs::write(format!("/proc/{pid}/uid_map"), &map)
        .with_context(|| format!("failed to write uid_map of {pid}"))?;
    fs::write(format!("/proc/{pid}/setgroups"), "deny")
        .with_context(|| format!("failed to write setgroups of {pid}"))?;
    fs::write(format!("/proc/{pid}/gid_map"), &map)
        .with_context(|| format!("failed to write gid_map of {pid}"))?;
    Ok(())
}

/// Reserved layer: descend to an unprivileged uid/gid.
///
/// Overlaps with the user namespace mapping applied by default and is not
/// wired into the default spawn path. Deployments that want both call this
/// from their entry function before touching untrusted input.
pub fn descend_ids(uid: u32, gid: u32) -> Result<(), Error> {
    let gid = unistd::Gid::from_raw(gid);
    unistd::setresgid(gid, gid, gid).context("failed to set resgid")?;
    let uid = unistd::Uid::from_raw(uid);
    unistd::setresuid(uid, uid, uid).context("failed to set resuid")?;
    Ok(())
}

/// Reserved layer: confine the filesystem view to `root`.
///
/// Like [`descend_ids`] this is a designed but not default-enabled layer.
/// `SpawnRequest::isolation_root` carries the intended root but the default
/// spawn path does not apply it.
pub fn confine_root(root: &Path) -> Result<(), Error> {
    unistd::chroot(root)
        .with_context(|| format!("failed to chroot to {}", root.display()))?;
    std::env::set_current_dir("/").context("failed to chdir to /")?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn empty_override_set_skips_nothing() {
        let skip = HashSet::new();
        assert!(!skipped(SandboxLayer::NoNewPrivs, &skip));
        assert!(!skipped(SandboxLayer::DropCapabilities, &skip));
    }

    // In test builds the override set is honored.
    #[test]
    fn override_set_is_honored_in_test_builds() {
        let mut skip = HashSet::new();
        skip.insert(SandboxLayer::DropCapabilities);
        assert!(skipped(SandboxLayer::DropCapabilities, &skip));
        assert!(!skipped(SandboxLayer::NoNewPrivs, &skip));
    }
}
