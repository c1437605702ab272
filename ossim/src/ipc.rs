//! System V IPC primitives shared with the orchestrator.
//!
//! - [`shmem`]: scoped shared memory attachment (the simulated clock).
//! - [`msgq`]: message queue endpoint carrying the fixed wire record.

pub mod msgq;
pub mod shmem;

use rustix::io::Errno;

/// Reads `errno` after a failed libc call.
pub(crate) fn last_errno() -> Errno {
    Errno::from_io_error(&std::io::Error::last_os_error()).unwrap_or(Errno::INVAL)
}

/// Whether an errno means the host refuses System V IPC altogether
/// (seccomp sandboxes, missing kernel support).
#[must_use]
pub fn ipc_unavailable(errno: Errno) -> bool {
    errno == Errno::ACCESS || errno == Errno::PERM || errno == Errno::NOSYS
}
