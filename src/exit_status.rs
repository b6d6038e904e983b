use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Process exit code.
pub type ExitCode = i32;

/// Exit status of a worker process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Process exited with exit code.
    Exit(ExitCode),
    /// Process was terminated by a signal.
    Signalled(u8),
}

impl ExitStatus {
    /// The entry function returned normally.
    pub const SUCCESS: ExitCode = 0;

    /// The entry function returned an error or panicked. A textual trace was
    /// written to the worker's captured stderr first.
    pub const ENTRY_FAILED: ExitCode = 1;

    /// Sandbox setup failed before the entry function ran. Distinct from
    /// [`Self::ENTRY_FAILED`] so the controller can tell developer errors
    /// from sandbox environment failures by exit status alone.
    pub const SANDBOX_FAILED: ExitCode = 64;

    /// Was termination successful? Signal termination is not considered a
    /// success, and success is defined as a zero exit status.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exit(code) if *code == Self::SUCCESS)
    }

    /// Returns the exit code of the process, if any.
    pub fn code(&self) -> Option<ExitCode> {
        match self {
            ExitStatus::Exit(code) => Some(*code),
            ExitStatus::Signalled(_) => None,
        }
    }
}

impl From<Signal> for ExitStatus {
    fn from(signal: Signal) -> Self {
        ExitStatus::Signalled(signal as u8)
    }
}

impl From<ExitCode> for ExitStatus {
    fn from(code: ExitCode) -> Self {
        ExitStatus::Exit(code)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exit(code) => write!(f, "Exit({code})"),
            ExitStatus::Signalled(signal) => match Signal::try_from(*signal as i32) {
                Ok(signal) => write!(f, "Signalled({signal})"),
                Err(_) => write!(f, "Signalled({signal})"),
            },
        }
    }
}
