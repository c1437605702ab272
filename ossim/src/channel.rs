//! Rendezvous messaging between a worker and the orchestrator.
//!
//! A [`Transport`] moves raw [`WireMessage`]s and filters by [`Tag`];
//! [`Rendezvous`] binds one to a worker's identity and speaks the two
//! exchanges of a cycle:
//!
//! ```text
//! Worker                                   OSS
//!   │                                       │
//!   │        Grant(quantum)       [pid]     │
//!   │<──────────────────────────────────────│
//!   │  GrantReply(status, ±used) [pid+1000] │
//!   │──────────────────────────────────────>│
//!   │                                       │
//!   │  (unless terminating)                 │
//!   │  ResourceRequest(delta)     [pid]     │
//!   │──────────────────────────────────────>│
//!   │  ResourceReply(granted)    [pid+1000] │
//!   │<──────────────────────────────────────│
//! ```
//!
//! Both primitives block. There is no timeout; a signal interrupts a
//! blocked call with [`ChannelError::Interrupted`].
//!
//! Each tag carries traffic in both directions, so until the peer dequeues
//! a record its sender can read it back. [`EchoFilter`] remembers what was
//! sent since the last genuine receive and puts such records back on the
//! queue instead of handing them up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rustix::io::Errno;
use thiserror::Error;

use crate::protocol::{
    DecodeError, Grant, GrantReply, MessageParseError, OssMessage, OssMessageKind,
    ResourceReply, ResourceRequest, Tag, WireMessage, WorkerId, WorkerMessage,
};
use crate::resources::ResourceDelta;
use crate::trace::{debug, trace};

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `msgget` failed.
    #[error("creating message queue failed: {0}")]
    Create(Errno),
    /// `msgsnd` failed.
    #[error("send with tag {tag} failed: {source}")]
    Send { tag: Tag, source: Errno },
    /// `msgrcv` failed.
    #[error("receive for tag {tag} failed: {source}")]
    Receive { tag: Tag, source: Errno },
    /// A signal arrived while blocked.
    #[error("interrupted by signal")]
    Interrupted,
    /// The queue was removed by its owner.
    #[error("message queue {0} was removed")]
    Removed(libc::c_int),
    /// The queue identifier can never name a queue.
    #[error("invalid message queue id {0}")]
    InvalidQueue(libc::c_int),
    /// The transport has no more messages and never will.
    #[error("transport closed")]
    Closed,
    /// A record arrived with fields out of range.
    #[error("malformed message: {0}")]
    Malformed(#[from] DecodeError),
    /// A record decoded to the wrong message kind.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] MessageParseError),
}

/// Tag-filtered, blocking message medium.
pub trait Transport {
    /// Enqueues `message` under its own tag, blocking while the medium is
    /// full.
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError>;

    /// Blocks until a message tagged `tag` is available and dequeues it.
    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        (**self).send(message)
    }

    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError> {
        (**self).receive(tag)
    }
}

/// Pause between putting an own record back and looking again.
const ECHO_BACKOFF: Duration = Duration::from_micros(50);

/// Transport that never returns a record its own side sent.
///
/// Sent records stay in flight until the next genuine receive: on this
/// protocol a reply from the peer means it has consumed everything sent
/// before it. A receive that finds an in-flight record re-enqueues it,
/// backs off and tries again.
pub struct EchoFilter<'a, T> {
    inner: T,
    in_flight: Vec<WireMessage>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, T: Transport> EchoFilter<'a, T> {
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            in_flight: Vec::new(),
            cancel: None,
        }
    }

    /// Abandons a receive that is waiting out an echo once `flag` is set.
    /// A blocked receive does not need this; a signal interrupts it.
    #[must_use]
    pub fn cancel_on(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Records sent and not yet answered.
    #[must_use]
    pub fn in_flight(&self) -> &[WireMessage] {
        &self.in_flight
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for EchoFilter<'_, T> {
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        self.inner.send(message)?;
        self.in_flight.push(*message);
        Ok(())
    }

    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError> {
        loop {
            let wire = self.inner.receive(tag)?;
            if !self.in_flight.contains(&wire) {
                self.in_flight.clear();
                return Ok(wire);
            }
            debug!(%tag, "read back own record, requeueing");
            self.inner.send(&wire)?;
            if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(ChannelError::Interrupted);
            }
            thread::sleep(ECHO_BACKOFF);
        }
    }
}

/// A worker's end of the request/reply protocol.
pub struct Rendezvous<'a, T> {
    transport: EchoFilter<'a, T>,
    id: WorkerId,
}

impl<'a, T: Transport> Rendezvous<'a, T> {
    #[must_use]
    pub fn new(transport: T, id: WorkerId) -> Self {
        Self {
            transport: EchoFilter::new(transport),
            id,
        }
    }

    /// See [`EchoFilter::cancel_on`].
    #[must_use]
    pub fn cancel_on(mut self, flag: &'a AtomicBool) -> Self {
        self.transport = self.transport.cancel_on(flag);
        self
    }

    /// Encodes `message` and sends it under `tag`.
    ///
    /// # Errors
    ///
    /// Propagates the transport's failure.
    pub fn send(&mut self, tag: Tag, message: WorkerMessage) -> Result<(), ChannelError> {
        trace!(%tag, ?message, "send");
        self.transport.send(&message.encode(tag))
    }

    /// Receives the next record tagged `tag` and decodes it as `kind`.
    ///
    /// # Errors
    ///
    /// Propagates the transport's failure, or [`ChannelError::Malformed`].
    pub fn receive(&mut self, tag: Tag, kind: OssMessageKind) -> Result<OssMessage, ChannelError> {
        let wire = self.transport.receive(tag)?;
        let message = OssMessage::decode(&wire, kind)?;
        trace!(%tag, ?message, "receive");
        Ok(message)
    }

    /// Waits for the next scheduling grant.
    ///
    /// # Errors
    ///
    /// See [`Rendezvous::receive`].
    pub fn await_grant(&mut self) -> Result<Grant, ChannelError> {
        let message = self.receive(self.id.inbound_tag(), OssMessageKind::Grant)?;
        Ok(Grant::try_from(message)?)
    }

    /// Answers the grant just consumed.
    ///
    /// # Errors
    ///
    /// See [`Rendezvous::send`].
    pub fn reply_to_grant(&mut self, reply: GrantReply) -> Result<(), ChannelError> {
        self.send(self.id.reply_tag(), WorkerMessage::GrantReply(reply))
    }

    /// Sends a resource request and waits for the orchestrator's decision.
    ///
    /// # Errors
    ///
    /// See [`Rendezvous::send`] and [`Rendezvous::receive`].
    pub fn negotiate(&mut self, delta: ResourceDelta) -> Result<ResourceReply, ChannelError> {
        self.send(
            self.id.inbound_tag(),
            WorkerMessage::ResourceRequest(ResourceRequest { delta }),
        )?;
        let message = self.receive(self.id.reply_tag(), OssMessageKind::ResourceReply)?;
        Ok(ResourceReply::try_from(message)?)
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.transport.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CycleStatus, RESOURCE_REQUEST_STATUS};
    use crate::testing::{LateOss, ScriptedOss};

    const ID: WorkerId = WorkerId::new(321);

    #[test]
    fn test_await_grant_filters_by_tag() {
        let mut oss = ScriptedOss::new(ID);
        oss.resource_reply(true);
        oss.grant(5_000);
        let mut channel = Rendezvous::new(&mut oss, ID);

        // the pending reply under pid+1000 is skipped
        assert_eq!(channel.await_grant().unwrap(), Grant { quantum: 5_000 });
    }

    #[test]
    fn test_reply_to_grant_uses_reply_tag() {
        let mut oss = ScriptedOss::new(ID);
        let mut channel = Rendezvous::new(&mut oss, ID);
        channel
            .reply_to_grant(GrantReply {
                status: CycleStatus::Blocked,
                consumed: 12,
            })
            .unwrap();

        let sent = oss.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mtype, 321 + 1000);
        assert_eq!(sent[0].status, 2);
        assert_eq!(sent[0].result, 12);
    }

    #[test]
    fn test_negotiate_round_trip() {
        let mut oss = ScriptedOss::new(ID);
        oss.resource_reply(false);
        let mut channel = Rendezvous::new(&mut oss, ID);

        let reply = channel.negotiate(ResourceDelta::request(0, 2)).unwrap();
        assert!(!reply.granted);

        let sent = oss.sent();
        assert_eq!(sent[0].mtype, 321);
        assert_eq!(sent[0].status, RESOURCE_REQUEST_STATUS);
        assert_eq!(sent[0].resource_request[0], 2);
    }

    #[test]
    fn test_exhausted_transport_is_closed() {
        let mut oss = ScriptedOss::new(ID);
        let mut channel = Rendezvous::new(&mut oss, ID);
        assert!(matches!(channel.await_grant(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_malformed_grant() {
        let mut oss = ScriptedOss::new(ID);
        oss.push_raw(WireMessage {
            mtype: ID.inbound_tag().as_raw(),
            quantum: -1,
            ..WireMessage::default()
        });
        let mut channel = Rendezvous::new(&mut oss, ID);
        assert!(matches!(
            channel.await_grant(),
            Err(ChannelError::Malformed(DecodeError::NegativeQuantum(-1)))
        ));
    }

    #[test]
    fn test_genuine_receive_clears_in_flight() {
        let mut oss = ScriptedOss::new(ID);
        oss.grant(5);
        let mut filter = EchoFilter::new(&mut oss);
        filter.send(&WireMessage::tagged(ID.reply_tag())).unwrap();
        assert_eq!(filter.in_flight().len(), 1);

        filter.receive(ID.inbound_tag()).unwrap();
        assert!(filter.in_flight().is_empty());
    }

    #[test]
    fn test_own_reply_requeued_until_orchestrator_answers() {
        let mut late = LateOss::new(3);
        late.reply_later(
            OssMessage::ResourceReply(ResourceReply { granted: true }),
            ID.reply_tag(),
        );
        let mut channel = Rendezvous::new(&mut late, ID);
        channel
            .reply_to_grant(GrantReply {
                status: CycleStatus::UsedFullQuantum,
                consumed: 1,
            })
            .unwrap();

        // the grant-reply sits on the same tag the resource reply will use
        let reply = channel.negotiate(ResourceDelta::request(0, 1)).unwrap();
        assert!(reply.granted);
        assert_eq!(late.taken().len(), 2);
        assert_eq!(late.queued(), 0);
    }

    #[test]
    fn test_cancel_stops_waiting_out_own_record() {
        let mut late = LateOss::new(usize::MAX);
        let flag = AtomicBool::new(true);
        let mut channel = Rendezvous::new(&mut late, ID).cancel_on(&flag);
        channel
            .reply_to_grant(GrantReply {
                status: CycleStatus::Blocked,
                consumed: 7,
            })
            .unwrap();

        assert!(matches!(
            channel.negotiate(ResourceDelta::none()),
            Err(ChannelError::Interrupted)
        ));
        // both records are still there for the orchestrator
        assert_eq!(late.queued(), 2);
    }
}
