//! Report lines printed on stdout.
//!
//! The orchestrator's harness parses these, so labels, spacing and order
//! are fixed. Note the startup block separates pid and ppid with a comma
//! and labels nanoseconds `SysClockNano`, while the per-cycle block has no
//! comma and uses `SysClockN`.

use std::io::{self, Write};

use crate::clock::ClockSnapshot;
use crate::worker::WorkerIdentity;

/// Usage example printed when arguments are missing.
pub const USAGE: &str = "[Example] ./worker <seconds> <nanoseconds> <shm_id> <msq_id>";

const RULE: &str = "----------------------------------------";

/// Writes the report contract to any sink.
pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn startup(
        &mut self,
        identity: &WorkerIdentity,
        start: ClockSnapshot,
        termination: ClockSnapshot,
    ) -> io::Result<()> {
        writeln!(self.out, "WORKER PID: {}, PPID: {}", identity.pid, identity.ppid)?;
        writeln!(
            self.out,
            "SysClockS: {} SysClockNano: {}",
            start.seconds(),
            start.nanoseconds()
        )?;
        self.termination_line(termination)?;
        writeln!(self.out, "--Just Starting")?;
        writeln!(self.out, "{RULE}")?;
        self.out.flush()
    }

    pub fn cycle(
        &mut self,
        identity: &WorkerIdentity,
        now: ClockSnapshot,
        termination: ClockSnapshot,
        messages_received: u64,
    ) -> io::Result<()> {
        writeln!(self.out, "WORKER PID: {} PPID: {}", identity.pid, identity.ppid)?;
        writeln!(
            self.out,
            "SysClockS: {} SysClockN: {}",
            now.seconds(),
            now.nanoseconds()
        )?;
        self.termination_line(termination)?;
        writeln!(self.out, "--{messages_received} messages received from OSS.")?;
        self.out.flush()
    }

    pub fn deadline_passed(&mut self, messages_received: u64) -> io::Result<()> {
        writeln!(
            self.out,
            "--Terminating after sending message back to OSS after {messages_received} received messages."
        )?;
        self.out.flush()
    }

    pub fn exiting(&mut self, identity: &WorkerIdentity) -> io::Result<()> {
        writeln!(self.out, "WORKER PID: {} is exiting now.", identity.pid)?;
        self.out.flush()
    }

    pub fn sigterm(&mut self) -> io::Result<()> {
        writeln!(self.out, "WORKER: Received SIGTERM, exiting immediately.")?;
        self.out.flush()
    }

    fn termination_line(&mut self, termination: ClockSnapshot) -> io::Result<()> {
        writeln!(
            self.out,
            "TermTimeS: {} TermTimeNano: {}",
            termination.seconds(),
            termination.nanoseconds()
        )
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
