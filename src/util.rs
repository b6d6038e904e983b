use nix::{
    errno::Errno,
    libc::{self, c_ulong},
    sys::signal::Signal,
};

/// Set the parent death signal of the calling process.
pub(crate) fn set_parent_death_signal(signal: Signal) -> nix::Result<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal as c_ulong, 0, 0, 0) };
    Errno::result(result).map(drop)
}

/// Set the name of the current process. Names longer than 15 bytes are
/// silently truncated by the kernel, see prctl(2).
pub(crate) fn set_process_name(name: &str) -> nix::Result<()> {
    let mut name = name.as_bytes().to_vec();
    name.truncate(15);
    name.push(b'\0');

    let result = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as c_ulong, 0, 0, 0) };
    Errno::result(result).map(drop)
}

/// Set `PR_SET_NO_NEW_PRIVS` for the remainder of this process tree.
pub(crate) fn set_no_new_privs() -> nix::Result<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as c_ulong, 0, 0, 0) };
    Errno::result(result).map(drop)
}
