//! System V message queue endpoint.
//!
//! The orchestrator creates one queue for all workers and hands its `msqid`
//! to each worker on the command line. Messages are routed by `mtype`; see
//! [`crate::protocol`] for the tag convention.
//!
//! The same typestate split as [`shmem`](super::shmem) applies:
//! [`Creator`](super::shmem::Creator) queues are removed on drop,
//! [`Opener`](super::shmem::Opener) queues are left alone.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{null_mut, from_mut, from_ref};

use rustix::io::Errno;

use super::last_errno;
use super::shmem::{Creator, Opener, ShmMode};
use crate::channel::{ChannelError, Transport};
use crate::protocol::{Tag, WireMessage};
use crate::trace::debug;

/// Identifier of a System V message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MsqId(libc::c_int);

impl MsqId {
    #[must_use]
    pub const fn new(raw: libc::c_int) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for MsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle on a System V message queue.
pub struct MsgQueue<Mode: ShmMode> {
    id: MsqId,
    _mode: PhantomData<Mode>,
}

impl MsgQueue<Creator> {
    /// Creates a private queue, removed again on drop.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `msgget` fails.
    pub fn create_private() -> Result<Self, ChannelError> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let raw = unsafe { libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600) };
        if raw == -1 {
            return Err(ChannelError::Create(last_errno()));
        }
        Ok(Self {
            id: MsqId(raw),
            _mode: PhantomData,
        })
    }
}

impl MsgQueue<Opener> {
    /// Uses a queue created by another process.
    ///
    /// Only the identifier is checked here; a queue that does not exist
    /// shows up on the first send or receive.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidQueue`] for a negative id.
    pub fn open(id: MsqId) -> Result<Self, ChannelError> {
        if id.0 < 0 {
            return Err(ChannelError::InvalidQueue(id.0));
        }
        Ok(Self {
            id,
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> MsgQueue<Mode> {
    #[must_use]
    pub fn id(&self) -> MsqId {
        self.id
    }

    fn classify(&self, err: Errno, or: ChannelError) -> ChannelError {
        match err {
            Errno::INTR => ChannelError::Interrupted,
            Errno::IDRM => ChannelError::Removed(self.id.0),
            _ => or,
        }
    }

    /// Receives without blocking.
    ///
    /// Returns `Ok(None)` when nothing tagged `tag` is queued.
    ///
    /// # Errors
    ///
    /// Any failure other than an empty queue.
    pub fn try_receive(&self, tag: Tag) -> Result<Option<WireMessage>, ChannelError> {
        match self.raw_receive(tag, libc::IPC_NOWAIT) {
            Err(ChannelError::Receive { source, .. }) if source == Errno::NOMSG => Ok(None),
            other => other.map(Some),
        }
    }

    fn raw_send(&self, message: &WireMessage, flags: libc::c_int) -> Result<(), ChannelError> {
        // SAFETY: message is a repr(C) msgbuf whose payload spans
        // PAYLOAD_SIZE bytes after mtype.
        let rc = unsafe {
            libc::msgsnd(
                self.id.0,
                from_ref(message).cast(),
                WireMessage::PAYLOAD_SIZE,
                flags,
            )
        };
        if rc == -1 {
            let err = last_errno();
            return Err(self.classify(
                err,
                ChannelError::Send {
                    tag: message.tag(),
                    source: err,
                },
            ));
        }
        Ok(())
    }

    fn raw_receive(&self, tag: Tag, flags: libc::c_int) -> Result<WireMessage, ChannelError> {
        let mut message = WireMessage::default();
        // SAFETY: message is a writable repr(C) msgbuf with room for
        // PAYLOAD_SIZE bytes after mtype; shorter messages leave the tail
        // zeroed.
        let received = unsafe {
            libc::msgrcv(
                self.id.0,
                from_mut(&mut message).cast(),
                WireMessage::PAYLOAD_SIZE,
                tag.as_raw(),
                flags,
            )
        };
        if received == -1 {
            let err = last_errno();
            return Err(self.classify(err, ChannelError::Receive { tag, source: err }));
        }
        if (received as usize) < WireMessage::PAYLOAD_SIZE {
            debug!(%tag, received, expected = WireMessage::PAYLOAD_SIZE, "short message");
        }
        Ok(message)
    }
}

impl<Mode: ShmMode> Transport for MsgQueue<Mode> {
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        self.raw_send(message, 0)
    }

    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError> {
        self.raw_receive(tag, 0)
    }
}

impl<Mode: ShmMode> Drop for MsgQueue<Mode> {
    fn drop(&mut self) {
        if Mode::REMOVE_ON_DROP {
            // SAFETY: IPC_RMID takes no buffer.
            unsafe {
                libc::msgctl(self.id.0, libc::IPC_RMID, null_mut());
            }
        }
    }
}
