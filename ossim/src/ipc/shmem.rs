//! System V shared memory attachment with typestate-based cleanup.
//!
//! The orchestrator owns the simulated clock and publishes it as a System V
//! segment identified by an integer `shmid`. Workers attach it read-only for
//! the lifetime of the process and detach on every exit path.
//!
//! # Overview
//!
//! - [`Shm<T, Mode>`] - Smart pointer to an attached segment
//! - [`SharedMemorySafe`] - Trait marking types safe for cross-process sharing
//! - [`Creator`] - Typestate marker: creates a private segment, removes it on drop
//! - [`Opener`] - Typestate marker: attaches an existing segment read-only, detaches on drop
//!
//! # Basic Usage
//!
//! ```no_run
//! use ossim::clock::SimClock;
//! use ossim::ipc::shmem::{Opener, Shm, ShmId};
//!
//! let clock = Shm::<SimClock, Opener>::attach(ShmId::new(42))?;
//! let now = clock.snapshot();
//! # Ok::<(), ossim::ipc::shmem::ShmError>(())
//! ```
//!
//! # Cleanup
//!
//! | Mode | On Drop |
//! |------|---------|
//! | [`Creator`] | `shmdt()` + `shmctl(IPC_RMID)` |
//! | [`Opener`] | `shmdt()` only |
//!
//! The kernel frees the segment once it is marked for removal and the last
//! process has detached, so a worker still attached keeps reading valid
//! memory after the orchestrator removes it.

use rustix::io::Errno;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{size_of, zeroed};
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null, null_mut};
use std::sync::atomic::*;

use super::last_errno;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Identifier of a System V shared memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShmId(libc::c_int);

impl ShmId {
    /// Wraps a raw `shmid` as handed out by `shmget`.
    #[must_use]
    pub const fn new(raw: libc::c_int) -> Self {
        Self(raw)
    }

    /// Returns the raw `shmid`.
    #[must_use]
    pub const fn as_raw(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contextual errors produced by [`Shm`].
#[derive(Debug)]
pub enum ShmError {
    /// The segment identifier can never name a segment.
    InvalidId { id: ShmId, reason: &'static str },
    /// `shmget`, `shmat`, `shmctl` failed with an errno.
    SysV {
        op: &'static str,
        id: ShmId,
        source: Errno,
    },
    /// The segment is smaller than `T`.
    SizeMismatch {
        id: ShmId,
        expected: usize,
        actual: usize,
    },
}

impl ShmError {
    fn sysv(op: &'static str, id: ShmId, err: Errno) -> Self {
        Self::SysV { op, id, source: err }
    }

    /// The errno behind a failed System V call, if any.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ShmError::SysV { source, .. } => Some(*source),
            _ => None,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidId { id, reason } => {
                write!(f, "invalid shared memory id `{}`: {}", id, reason)
            }
            ShmError::SysV { op, id, source } => {
                write!(f, "{} failed for segment `{}`: {}", op, id, source)
            }
            ShmError::SizeMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "shared memory segment `{}` too small: expected at least {} bytes, got {}",
                id, expected, actual
            ),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::SysV { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Cleanup and access behavior of an attachment.
///
/// Implemented by the [`Creator`] and [`Opener`] markers only.
pub trait ShmMode {
    /// Whether to mark the segment for removal on drop.
    const REMOVE_ON_DROP: bool;
    /// Flags passed to `shmat`.
    const ATTACH_FLAGS: libc::c_int;
}

/// Typestate marker for the process that creates the segment.
///
/// Attaches read-write and marks the segment for removal on drop. The
/// orchestrator plays this role; inside this crate it backs tests and
/// local harnesses.
pub struct Creator;
impl ShmMode for Creator {
    const REMOVE_ON_DROP: bool = true;
    const ATTACH_FLAGS: libc::c_int = 0;
}

/// Typestate marker for processes that attach an existing segment.
///
/// Attaches read-only (`SHM_RDONLY`); on drop the segment is detached and
/// left for the creator to remove.
pub struct Opener;
impl ShmMode for Opener {
    const REMOVE_ON_DROP: bool = false;
    const ATTACH_FLAGS: libc::c_int = libc::SHM_RDONLY;
}

/// Types safe to place in memory shared with another process.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` or `#[repr(transparent)]` layout, so the orchestrator
///   (compiled separately, possibly in another language) agrees on offsets
/// - no pointers, references or heap allocations
/// - every field is itself `SharedMemorySafe`
/// - concurrent access from other processes is sound, which in practice
///   means mutable state is held in atomics
/// - soundness does not depend on `Drop` running
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64,
    u8, u16, u32, u64,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to an attached System V segment.
///
/// # Safety Invariants
///
/// - `ptr` is the address returned by a successful `shmat()`
/// - the segment is at least `size_of::<T>()` bytes
/// - the mapping stays attached for the lifetime of `Shm<T>`
/// - `shmat` returns page-aligned addresses, satisfying `T`'s alignment
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    id: ShmId,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync, and the pointer refers
// to process-shared memory rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: shared access goes through &T, which is Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

fn validate_shm_id(id: ShmId) -> Result<()> {
    if id.0 < 0 {
        return Err(ShmError::InvalidId {
            id,
            reason: "segment id must be non-negative",
        });
    }
    Ok(())
}

fn stat(id: ShmId) -> Result<libc::shmid_ds> {
    // SAFETY: shmid_ds is a plain C struct; all-zero is a valid value.
    let mut ds: libc::shmid_ds = unsafe { zeroed() };
    // SAFETY: ds is a valid, writable shmid_ds for IPC_STAT to fill.
    let rc = unsafe { libc::shmctl(id.0, libc::IPC_STAT, &mut ds) };
    if rc == -1 {
        return Err(ShmError::sysv("shmctl(IPC_STAT)", id, last_errno()));
    }
    Ok(ds)
}

fn segment_size(id: ShmId) -> Result<usize> {
    Ok(stat(id)?.shm_segsz as usize)
}

fn attach<T, Mode: ShmMode>(id: ShmId) -> Result<NonNull<T>> {
    // SAFETY: a null address lets the kernel pick a page-aligned location;
    // the result is checked against the (void*)-1 failure sentinel.
    let addr = unsafe { libc::shmat(id.0, null(), Mode::ATTACH_FLAGS) };
    if addr as isize == -1 {
        return Err(ShmError::sysv("shmat", id, last_errno()));
    }
    NonNull::new(addr.cast::<T>()).ok_or(ShmError::SysV {
        op: "shmat",
        id,
        source: Errno::FAULT,
    })
}

fn remove_segment(id: ShmId) {
    // SAFETY: IPC_RMID takes no buffer.
    unsafe {
        libc::shmctl(id.0, libc::IPC_RMID, null_mut());
    }
}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Creates a private segment sized for `T`, attaches it read-write and
    /// initializes it with `T::default()`.
    ///
    /// Other processes reach the segment through [`Shm::id`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if `shmget` or `shmat` fail (quota, permissions,
    /// sandboxed IPC). The segment is removed again when attach fails.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `T::default()` after detaching and removing
    /// the segment.
    pub fn create_private() -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let raw = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size_of::<T>(),
                libc::IPC_CREAT | 0o600,
            )
        };
        let id = ShmId(raw);
        if raw == -1 {
            return Err(ShmError::sysv("shmget", id, last_errno()));
        }

        let ptr = match attach::<T, Creator>(id) {
            Ok(ptr) => ptr,
            Err(err) => {
                remove_segment(id);
                return Err(err);
            }
        };

        let shm = Self {
            ptr,
            id,
            _mode: PhantomData,
        };

        let init_result = catch_unwind(AssertUnwindSafe(|| unsafe {
            std::ptr::write(shm.ptr.as_ptr(), T::default());
        }));

        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Attaches an existing segment read-only.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - `id` is negative
    /// - the segment does not exist or was removed (`EINVAL`, `EIDRM`)
    /// - the caller lacks read permission (`EACCES`)
    /// - the segment is smaller than `size_of::<T>()`
    pub fn attach(id: ShmId) -> Result<Self> {
        validate_shm_id(id)?;

        let actual = segment_size(id)?;
        if actual < size_of::<T>() {
            return Err(ShmError::SizeMismatch {
                id,
                expected: size_of::<T>(),
                actual,
            });
        }

        let ptr = attach::<T, Opener>(id)?;

        Ok(Self {
            ptr,
            id,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// The segment this guard is attached to.
    #[must_use]
    pub fn id(&self) -> ShmId {
        self.id
    }

    /// Number of processes currently attached, this one included.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `IPC_STAT` fails.
    pub fn attachments(&self) -> Result<u64> {
        Ok(stat(self.id)?.shm_nattch as u64)
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::shmdt(self.ptr.as_ptr().cast());
        }

        if Mode::REMOVE_ON_DROP {
            remove_segment(self.id);
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: ptr is valid for the lifetime of Shm:
        // 1. shmat succeeded during construction
        // 2. the segment stays attached until Drop
        // 3. T: SharedMemorySafe makes concurrent cross-process access sound
        unsafe { &*self.ptr.as_ptr() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ipc_unavailable;

    #[repr(C)]
    #[derive(Default)]
    struct Counter {
        value: AtomicU64,
    }
    unsafe impl SharedMemorySafe for Counter {}

    #[repr(C)]
    #[derive(Default)]
    struct Large {
        a: AtomicU64,
        b: AtomicU64,
        c: AtomicU64,
    }
    unsafe impl SharedMemorySafe for Large {}

    fn skip(name: &str, err: &ShmError) -> bool {
        if err.errno().is_some_and(ipc_unavailable) {
            eprintln!("Skipping {name}: {err}");
            return true;
        }
        false
    }

    #[test]
    fn test_creator_and_opener_share_memory() -> Result<()> {
        let counter = match Shm::<Counter, Creator>::create_private() {
            Ok(counter) => counter,
            Err(err) if skip("test_creator_and_opener_share_memory", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        assert_eq!(counter.value.load(Ordering::SeqCst), 0);
        counter.value.store(42, Ordering::SeqCst);

        {
            let reader = Shm::<Counter, Opener>::attach(counter.id())?;
            assert_eq!(reader.value.load(Ordering::SeqCst), 42);
            assert_eq!(counter.attachments()?, 2);

            counter.value.store(43, Ordering::SeqCst);
            assert_eq!(reader.value.load(Ordering::SeqCst), 43);
        } // Opener drops (detach only)

        // Segment still usable by the creator
        assert_eq!(counter.value.load(Ordering::SeqCst), 43);
        assert_eq!(counter.attachments()?, 1);
        Ok(())
    }

    #[test]
    fn test_attach_negative_id_rejected() {
        let result = Shm::<Counter, Opener>::attach(ShmId::new(-1));
        assert!(matches!(
            result,
            Err(ShmError::InvalidId { reason, .. }) if reason == "segment id must be non-negative"
        ));
    }

    #[test]
    fn test_attach_segment_too_small() -> Result<()> {
        let small = match Shm::<Counter, Creator>::create_private() {
            Ok(shm) => shm,
            Err(err) if skip("test_attach_segment_too_small", &err) => return Ok(()),
            Err(err) => return Err(err),
        };

        match Shm::<Large, Opener>::attach(small.id()) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Large>());
                assert_eq!(actual, size_of::<Counter>());
            }
            Err(e) => panic!("Expected SizeMismatch error, got: {e}"),
            Ok(_) => panic!("Expected SizeMismatch error, but attach() succeeded"),
        }
        Ok(())
    }

    #[test]
    fn test_attach_removed_segment_fails() {
        let id = match Shm::<Counter, Creator>::create_private() {
            Ok(shm) => shm.id(),
            Err(err) if skip("test_attach_removed_segment_fails", &err) => return,
            Err(err) => panic!("create failed: {err}"),
        }; // creator dropped: detached and removed

        let err = Shm::<Counter, Opener>::attach(id).err().expect("attach must fail");
        assert!(matches!(err, ShmError::SysV { .. }), "got {err}");
    }
}
