//! In-process doubles for unit tests: scripted dice, a scripted
//! orchestrator transport and a hand-driven clock.

use std::cell::Cell;
use std::collections::VecDeque;

use crate::channel::{ChannelError, Transport};
use crate::clock::{ClockSnapshot, ClockSource};
use crate::dice::Dice;
use crate::protocol::{
    Grant, OssMessage, ResourceReply, Tag, WireMessage, WorkerId, WorkerMessage,
    WorkerMessageKind,
};

/// Dice that replay a fixed sequence and panic when it runs out.
pub(crate) struct ScriptedDice {
    rolls: VecDeque<u32>,
}

impl ScriptedDice {
    pub(crate) fn new(rolls: impl IntoIterator<Item = u32>) -> Self {
        Self {
            rolls: rolls.into_iter().collect(),
        }
    }

    fn next(&mut self) -> u32 {
        self.rolls.pop_front().expect("dice script exhausted")
    }
}

impl Dice for ScriptedDice {
    fn percent(&mut self) -> u32 {
        let roll = self.next();
        assert!(roll < 100, "scripted percent {roll} out of range");
        roll
    }

    fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        let roll = self.next();
        assert!(roll < bound, "scripted draw {roll} not below {bound}");
        roll
    }
}

/// Transport standing in for the orchestrator: replays queued records by
/// tag and records everything the worker sends. An empty script reads as
/// [`ChannelError::Closed`].
pub(crate) struct ScriptedOss {
    id: WorkerId,
    inbox: VecDeque<WireMessage>,
    sent: Vec<WireMessage>,
}

impl ScriptedOss {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            inbox: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub(crate) fn grant(&mut self, quantum: u32) {
        let wire = OssMessage::Grant(Grant { quantum }).encode(self.id.inbound_tag());
        self.inbox.push_back(wire);
    }

    pub(crate) fn resource_reply(&mut self, granted: bool) {
        let wire = OssMessage::ResourceReply(ResourceReply { granted }).encode(self.id.reply_tag());
        self.inbox.push_back(wire);
    }

    pub(crate) fn push_raw(&mut self, wire: WireMessage) {
        self.inbox.push_back(wire);
    }

    pub(crate) fn sent(&self) -> &[WireMessage] {
        &self.sent
    }

    /// Decodes the `index`th sent record as `kind`.
    pub(crate) fn sent_as(&self, index: usize, kind: WorkerMessageKind) -> WorkerMessage {
        WorkerMessage::decode(&self.sent[index], kind).expect("decodable worker message")
    }
}

impl Transport for ScriptedOss {
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        self.sent.push(*message);
        Ok(())
    }

    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError> {
        let position = self
            .inbox
            .iter()
            .position(|m| m.tag() == tag)
            .ok_or(ChannelError::Closed)?;
        self.inbox.remove(position).ok_or(ChannelError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Worker,
    Oss,
}

/// One queue shared by both directions, as System V queues are, with an
/// orchestrator that only acts after the worker has polled `patience`
/// times. When it acts it dequeues everything the worker sent and posts its
/// next scripted reply.
pub(crate) struct LateOss {
    queue: VecDeque<(Side, WireMessage)>,
    patience: usize,
    polls: usize,
    replies: VecDeque<WireMessage>,
    taken: Vec<WireMessage>,
}

impl LateOss {
    pub(crate) fn new(patience: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            patience,
            polls: 0,
            replies: VecDeque::new(),
            taken: Vec::new(),
        }
    }

    /// Queues an orchestrator record right away.
    pub(crate) fn post(&mut self, message: OssMessage, tag: Tag) {
        self.queue.push_back((Side::Oss, message.encode(tag)));
    }

    /// Queues an orchestrator record for its next turn.
    pub(crate) fn reply_later(&mut self, message: OssMessage, tag: Tag) {
        self.replies.push_back(message.encode(tag));
    }

    /// Worker records the orchestrator has dequeued, in order.
    pub(crate) fn taken(&self) -> &[WireMessage] {
        &self.taken
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    fn orchestrator_turn(&mut self) {
        let (from_worker, rest): (Vec<_>, Vec<_>) =
            self.queue.drain(..).partition(|(side, _)| *side == Side::Worker);
        self.taken.extend(from_worker.into_iter().map(|(_, wire)| wire));
        self.queue = rest.into();
        if let Some(reply) = self.replies.pop_front() {
            self.queue.push_back((Side::Oss, reply));
        }
        self.polls = 0;
    }
}

impl Transport for LateOss {
    fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        self.queue.push_back((Side::Worker, *message));
        Ok(())
    }

    fn receive(&mut self, tag: Tag) -> Result<WireMessage, ChannelError> {
        self.polls += 1;
        if self.polls > self.patience {
            self.orchestrator_turn();
        }
        let position = self
            .queue
            .iter()
            .position(|(_, wire)| wire.tag() == tag)
            .ok_or(ChannelError::Closed)?;
        self.queue
            .remove(position)
            .map(|(_, wire)| wire)
            .ok_or(ChannelError::Closed)
    }
}

/// Clock the test moves by hand.
pub(crate) struct ManualClock {
    now: Cell<ClockSnapshot>,
}

impl ManualClock {
    pub(crate) fn at(seconds: u32, nanoseconds: u32) -> Self {
        Self {
            now: Cell::new(ClockSnapshot::new(seconds, nanoseconds)),
        }
    }

    pub(crate) fn set(&self, seconds: u32, nanoseconds: u32) {
        self.now.set(ClockSnapshot::new(seconds, nanoseconds));
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> ClockSnapshot {
        self.now.get()
    }
}
