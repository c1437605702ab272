//! Cooperative SIGTERM handling.
//!
//! The handler only raises a process-wide flag. It is installed without
//! `SA_RESTART`, so a worker blocked in `msgrcv`/`msgsnd` wakes with
//! `EINTR`, sees the flag and unwinds normally, detaching shared memory on
//! the way out.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once SIGTERM arrives; never cleared.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// The flag raised by the SIGTERM handler.
#[must_use]
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN_REQUESTED
}

/// Installs the SIGTERM handler.
///
/// # Errors
///
/// Returns the OS error if `sigaction` fails.
pub fn install_sigterm_handler() -> io::Result<()> {
    // SAFETY: sigaction is plain data; zeroed is a valid starting point and
    // every field we rely on is set below. The handler only touches an
    // atomic, which is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        if libc::sigemptyset(&raw mut action.sa_mask) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGTERM, &raw const action, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigterm_raises_flag() {
        install_sigterm_handler().unwrap();
        assert!(!shutdown_flag().load(Ordering::Relaxed));

        // SAFETY: raise delivers to this thread; the handler only stores.
        let rc = unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(rc, 0);
        assert!(shutdown_flag().load(Ordering::Relaxed));
    }
}
