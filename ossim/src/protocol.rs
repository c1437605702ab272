//! Wire protocol between a worker and the orchestrator.
//!
//! Every exchange travels in one fixed System V `msgbuf` record:
//!
//! ```text
//! ┌──────────────┬────────┬─────────┬────────┬──────────────────────────┐
//! │ mtype (long) │ status │ quantum │ result │ resource_request[10]     │
//! │ routing tag  │ i32    │ i32     │ i32    │ i32 × RESOURCE_CLASSES   │
//! └──────────────┴────────┴─────────┴────────┴──────────────────────────┘
//! ```
//!
//! The record is overlaid for four message kinds:
//!
//! | Kind | Direction | Tag | Meaningful fields |
//! |------|-----------|-----|-------------------|
//! | [`Grant`] | OSS → worker | `pid` | `quantum` |
//! | [`GrantReply`] | worker → OSS | `pid + 1000` | `status`, `result` (signed consumed) |
//! | [`ResourceRequest`] | worker → OSS | `pid` | `status = 1`, `resource_request` |
//! | [`ResourceReply`] | OSS → worker | `pid + 1000` | `result == 1` means granted |
//!
//! The record does not say which kind it carries; the receiver knows from
//! where it is in the rendezvous. At the API level the kinds are separate
//! types grouped by direction into [`WorkerMessage`] and [`OssMessage`], and
//! `result` as a signed amount and `result` as a grant flag never meet.

use std::fmt;
use std::mem::size_of;

use thiserror::Error;

use crate::burst::Outcome;
use crate::resources::{RESOURCE_CLASSES, ResourceDelta};

/// Added to a worker's pid to tag replies.
pub const REPLY_TAG_OFFSET: libc::c_long = 1000;

/// `status` value marking a resource request.
pub const RESOURCE_REQUEST_STATUS: i32 = 1;

/// `result` value of a granted resource reply.
pub const RESOURCE_GRANTED: i32 = 1;

/// Process identity of a worker, used to derive its routing tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(i32);

impl WorkerId {
    #[must_use]
    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    #[must_use]
    pub const fn pid(self) -> i32 {
        self.0
    }

    /// Tag of grants addressed to this worker and of the resource requests
    /// it initiates.
    #[must_use]
    pub const fn inbound_tag(self) -> Tag {
        Tag(self.0 as libc::c_long)
    }

    /// Tag of replies: grant-replies from this worker and resource replies
    /// to it.
    #[must_use]
    pub const fn reply_tag(self) -> Tag {
        Tag(self.0 as libc::c_long + REPLY_TAG_OFFSET)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// System V message type used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Tag(libc::c_long);

impl Tag {
    #[must_use]
    pub const fn new(raw: libc::c_long) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> libc::c_long {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The on-wire record, laid out exactly like the orchestrator's C struct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WireMessage {
    pub mtype: libc::c_long,
    pub status: i32,
    pub quantum: i32,
    pub result: i32,
    pub resource_request: [i32; RESOURCE_CLASSES],
}

impl WireMessage {
    /// Byte count handed to `msgsnd`/`msgrcv`: the record minus `mtype`.
    pub const PAYLOAD_SIZE: usize = size_of::<Self>() - size_of::<libc::c_long>();

    /// An all-zero record with the given tag.
    #[must_use]
    pub fn tagged(tag: Tag) -> Self {
        Self {
            mtype: tag.0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag(self.mtype)
    }
}

/// Outcome classes reported in a grant-reply's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CycleStatus {
    Terminating = 0,
    UsedFullQuantum = 1,
    Blocked = 2,
}

impl TryFrom<i32> for CycleStatus {
    type Error = DecodeError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Terminating),
            1 => Ok(Self::UsedFullQuantum),
            2 => Ok(Self::Blocked),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// Scheduling grant: permission to run for `quantum` nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub quantum: u32,
}

/// The worker's answer to a [`Grant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantReply {
    pub status: CycleStatus,
    /// Nanoseconds consumed this cycle; negative when the worker terminates.
    pub consumed: i32,
}

impl From<Outcome> for GrantReply {
    fn from(outcome: Outcome) -> Self {
        Self {
            status: outcome.status(),
            consumed: outcome.reported(),
        }
    }
}

/// Request (or release) of resource instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub delta: ResourceDelta,
}

/// The orchestrator's decision on a [`ResourceRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceReply {
    pub granted: bool,
}

/// Messages sent from worker to orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    GrantReply(GrantReply),
    ResourceRequest(ResourceRequest),
}

/// Messages sent from orchestrator to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OssMessage {
    Grant(Grant),
    ResourceReply(ResourceReply),
}

/// Which message a receiver expects; the record cannot tell on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OssMessageKind {
    Grant,
    ResourceReply,
}

/// Which worker message the orchestrator side expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessageKind {
    GrantReply,
    ResourceRequest,
}

/// Error decoding a wire record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A grant carried a negative quantum.
    #[error("negative quantum {0}")]
    NegativeQuantum(i32),
    /// A grant carried no CPU time at all.
    #[error("grant with zero quantum")]
    ZeroQuantum,
    /// A grant-reply carried a status outside 0..=2.
    #[error("unknown cycle status {0}")]
    UnknownStatus(i32),
    /// A resource request lacked the request marker.
    #[error("expected resource request marker, got status {0}")]
    NotAResourceRequest(i32),
}

/// Error when narrowing a direction enum to one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageParseError {
    #[error("expected Grant, got ResourceReply")]
    ExpectedGrant,
    #[error("expected ResourceReply, got Grant")]
    ExpectedResourceReply,
    #[error("expected GrantReply, got ResourceRequest")]
    ExpectedGrantReply,
    #[error("expected ResourceRequest, got GrantReply")]
    ExpectedResourceRequest,
}

impl WorkerMessage {
    /// Lays the message out on the wire under `tag`.
    #[must_use]
    pub fn encode(&self, tag: Tag) -> WireMessage {
        let mut wire = WireMessage::tagged(tag);
        match self {
            WorkerMessage::GrantReply(reply) => {
                wire.status = reply.status as i32;
                wire.result = reply.consumed;
            }
            WorkerMessage::ResourceRequest(request) => {
                wire.status = RESOURCE_REQUEST_STATUS;
                wire.resource_request = *request.delta.as_array();
            }
        }
        wire
    }

    /// Reads a worker record as the orchestrator does.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the fields are out of range for `kind`.
    pub fn decode(wire: &WireMessage, kind: WorkerMessageKind) -> Result<Self, DecodeError> {
        match kind {
            WorkerMessageKind::GrantReply => Ok(Self::GrantReply(GrantReply {
                status: CycleStatus::try_from(wire.status)?,
                consumed: wire.result,
            })),
            WorkerMessageKind::ResourceRequest => {
                if wire.status != RESOURCE_REQUEST_STATUS {
                    return Err(DecodeError::NotAResourceRequest(wire.status));
                }
                Ok(Self::ResourceRequest(ResourceRequest {
                    delta: ResourceDelta::from_array(wire.resource_request),
                }))
            }
        }
    }
}

impl OssMessage {
    /// Lays the message out on the wire under `tag`.
    #[must_use]
    pub fn encode(&self, tag: Tag) -> WireMessage {
        let mut wire = WireMessage::tagged(tag);
        match self {
            OssMessage::Grant(grant) => {
                wire.quantum = i32::try_from(grant.quantum).unwrap_or(i32::MAX);
            }
            OssMessage::ResourceReply(reply) => {
                wire.result = if reply.granted { RESOURCE_GRANTED } else { 0 };
            }
        }
        wire
    }

    /// Reads an orchestrator record as the worker does.
    ///
    /// # Errors
    ///
    /// Returns `Err` for a grant whose quantum is not positive. Any `result` other
    /// than [`RESOURCE_GRANTED`] decodes as a denial.
    pub fn decode(wire: &WireMessage, kind: OssMessageKind) -> Result<Self, DecodeError> {
        match kind {
            OssMessageKind::Grant => {
                let quantum = u32::try_from(wire.quantum)
                    .map_err(|_| DecodeError::NegativeQuantum(wire.quantum))?;
                if quantum == 0 {
                    return Err(DecodeError::ZeroQuantum);
                }
                Ok(Self::Grant(Grant { quantum }))
            }
            OssMessageKind::ResourceReply => Ok(Self::ResourceReply(ResourceReply {
                granted: wire.result == RESOURCE_GRANTED,
            })),
        }
    }
}

impl TryFrom<OssMessage> for Grant {
    type Error = MessageParseError;

    fn try_from(msg: OssMessage) -> Result<Self, Self::Error> {
        match msg {
            OssMessage::Grant(grant) => Ok(grant),
            OssMessage::ResourceReply(_) => Err(MessageParseError::ExpectedGrant),
        }
    }
}

impl TryFrom<OssMessage> for ResourceReply {
    type Error = MessageParseError;

    fn try_from(msg: OssMessage) -> Result<Self, Self::Error> {
        match msg {
            OssMessage::ResourceReply(reply) => Ok(reply),
            OssMessage::Grant(_) => Err(MessageParseError::ExpectedResourceReply),
        }
    }
}

impl TryFrom<WorkerMessage> for GrantReply {
    type Error = MessageParseError;

    fn try_from(msg: WorkerMessage) -> Result<Self, Self::Error> {
        match msg {
            WorkerMessage::GrantReply(reply) => Ok(reply),
            WorkerMessage::ResourceRequest(_) => Err(MessageParseError::ExpectedGrantReply),
        }
    }
}

impl TryFrom<WorkerMessage> for ResourceRequest {
    type Error = MessageParseError;

    fn try_from(msg: WorkerMessage) -> Result<Self, Self::Error> {
        match msg {
            WorkerMessage::ResourceRequest(request) => Ok(request),
            WorkerMessage::GrantReply(_) => Err(MessageParseError::ExpectedResourceRequest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_tags_derived_from_pid() {
        let id = WorkerId::new(4242);
        assert_eq!(id.inbound_tag().as_raw(), 4242);
        assert_eq!(id.reply_tag().as_raw(), 5242);
    }

    #[test]
    fn test_wire_layout_matches_c_struct() {
        let long = size_of::<libc::c_long>();
        assert_eq!(offset_of!(WireMessage, status), long);
        assert_eq!(offset_of!(WireMessage, quantum), long + 4);
        assert_eq!(offset_of!(WireMessage, result), long + 8);
        assert_eq!(offset_of!(WireMessage, resource_request), long + 12);
        assert_eq!(
            WireMessage::PAYLOAD_SIZE,
            size_of::<WireMessage>() - long
        );
    }

    #[test]
    fn test_grant_reply_overlay() {
        let tag = WorkerId::new(7).reply_tag();
        let reply = GrantReply {
            status: CycleStatus::Terminating,
            consumed: -50_000,
        };
        let wire = WorkerMessage::GrantReply(reply).encode(tag);
        assert_eq!(wire.mtype, 1007);
        assert_eq!(wire.status, 0);
        assert_eq!(wire.result, -50_000);
        assert_eq!(wire.resource_request, [0; RESOURCE_CLASSES]);
    }

    #[test]
    fn test_resource_request_overlay() {
        let tag = WorkerId::new(7).inbound_tag();
        let delta = ResourceDelta::release(4, 2);
        let wire = WorkerMessage::ResourceRequest(ResourceRequest { delta }).encode(tag);
        assert_eq!(wire.mtype, 7);
        assert_eq!(wire.status, RESOURCE_REQUEST_STATUS);
        assert_eq!(wire.resource_request[4], -2);
        assert_eq!(wire.result, 0);
    }

    #[test]
    fn test_resource_reply_only_one_grants() {
        for (result, granted) in [(1, true), (0, false), (2, false), (-1, false)] {
            let wire = WireMessage {
                result,
                ..WireMessage::default()
            };
            let reply = OssMessage::decode(&wire, OssMessageKind::ResourceReply)
                .map(ResourceReply::try_from);
            assert_eq!(reply, Ok(Ok(ResourceReply { granted })));
        }
    }

    #[test]
    fn test_negative_quantum_rejected() {
        let wire = WireMessage {
            quantum: -5,
            ..WireMessage::default()
        };
        assert_eq!(
            OssMessage::decode(&wire, OssMessageKind::Grant),
            Err(DecodeError::NegativeQuantum(-5))
        );
    }

    #[test]
    fn test_zero_quantum_rejected() {
        // a resource request read back on the grant tag looks like this
        let wire = WorkerMessage::ResourceRequest(ResourceRequest {
            delta: ResourceDelta::request(0, 1),
        })
        .encode(WorkerId::new(7).inbound_tag());
        assert_eq!(
            OssMessage::decode(&wire, OssMessageKind::Grant),
            Err(DecodeError::ZeroQuantum)
        );
    }

    #[test]
    fn test_unknown_status_rejected() {
        let wire = WireMessage {
            status: 9,
            ..WireMessage::default()
        };
        assert_eq!(
            WorkerMessage::decode(&wire, WorkerMessageKind::GrantReply),
            Err(DecodeError::UnknownStatus(9))
        );
    }

    #[test]
    fn test_narrowing_wrong_variant() {
        let msg = OssMessage::Grant(Grant { quantum: 10 });
        assert_eq!(
            ResourceReply::try_from(msg),
            Err(MessageParseError::ExpectedResourceReply)
        );
        let msg = WorkerMessage::GrantReply(GrantReply {
            status: CycleStatus::Blocked,
            consumed: 3,
        });
        assert_eq!(
            ResourceRequest::try_from(msg),
            Err(MessageParseError::ExpectedResourceRequest)
        );
    }
}
