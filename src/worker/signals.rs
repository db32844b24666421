//! Crash analysis for workers that die without finishing the protocol.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// SIGKILL, most likely the kernel OOM killer.
    OutOfMemory,
    /// SIGSEGV, typically a stack overflow in deep evaluation.
    StackOverflow,
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::OutOfMemory => write!(f, "killed, likely by the OOM killer"),
            Self::StackOverflow => write!(f, "crashed with SIGSEGV, likely a stack overflow"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "terminated for an unknown reason"),
        }
    }
}

/// Map a `WaitStatus` to the most plausible termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, Signal::SIGSEGV, _) => TerminationReason::StackOverflow,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
