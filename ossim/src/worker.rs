//! The worker loop.
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!     AwaitingGrant ──► Replying ──► AwaitingResourceReply
//!            │              │
//!        (SIGTERM)     (terminal outcome)
//!            ▼              ▼
//!        ShutDown       Terminated
//! ```
//!
//! [`Worker::step`] runs one iteration of the cycle; [`Worker::run`] steps
//! until a terminal state. All mutable state lives in [`WorkerState`] and
//! persists across iterations, including held resources.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::process::{Pid, getpid, getppid};

use crate::burst::{BurstAccountant, Outcome};
use crate::channel::{ChannelError, Rendezvous, Transport};
use crate::clock::{BurstInterval, ClockSnapshot, ClockSource};
use crate::dice::Dice;
use crate::error::WorkerError;
use crate::protocol::{GrantReply, WorkerId};
use crate::report::Reporter;
use crate::resources::{HeldResources, ResourceDelta, propose};
use crate::signal;
use crate::trace::{debug, info, warn};

/// Process identity of a worker and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub pid: i32,
    pub ppid: i32,
}

impl WorkerIdentity {
    /// Identity of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: getpid().as_raw_nonzero().get(),
            ppid: Pid::as_raw(getppid()),
        }
    }

    /// Routing identity on the message queue.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(self.pid)
    }
}

/// Everything a worker tracks between cycles.
#[derive(Debug, Clone)]
pub struct WorkerState {
    identity: WorkerIdentity,
    start: ClockSnapshot,
    termination: ClockSnapshot,
    accountant: BurstAccountant,
    held: HeldResources,
    messages_received: u64,
}

impl WorkerState {
    /// Fresh state for a worker starting at `start` with `interval` to run.
    #[must_use]
    pub fn new(identity: WorkerIdentity, start: ClockSnapshot, interval: BurstInterval) -> Self {
        Self {
            identity,
            start,
            termination: start.advanced_by(interval),
            accountant: BurstAccountant::new(interval.total_nanos()),
            held: HeldResources::default(),
            messages_received: 0,
        }
    }

    #[must_use]
    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    #[must_use]
    pub fn start(&self) -> ClockSnapshot {
        self.start
    }

    #[must_use]
    pub fn termination(&self) -> ClockSnapshot {
        self.termination
    }

    #[must_use]
    pub fn accountant(&self) -> &BurstAccountant {
        &self.accountant
    }

    #[must_use]
    pub fn held(&self) -> &HeldResources {
        &self.held
    }

    /// Grants received so far.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }
}

/// Why a worker finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The burst limit was reached.
    BurstExhausted,
    /// The worker chose to exit partway through a quantum.
    VoluntaryExit,
}

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Completed { reason: Completion },
    /// SIGTERM was observed; the orchestrator was not told.
    ShutDown,
}

/// Result of a single iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The cycle finished and the worker waits for its next grant.
    Continue {
        outcome: Outcome,
        delta: ResourceDelta,
        granted: bool,
    },
    Finished(Exit),
}

/// Final statistics of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub exit: Exit,
    /// Grants received.
    pub cycles: u64,
    /// Simulated CPU nanoseconds consumed.
    pub cpu_consumed: u64,
    pub held: HeldResources,
}

/// A worker process's state machine.
pub struct Worker<'a, T, C, D, W: Write> {
    state: WorkerState,
    channel: Rendezvous<'a, T>,
    clock: C,
    dice: D,
    reporter: Reporter<W>,
    shutdown: &'a AtomicBool,
    finished: Option<Exit>,
}

impl<'a, T, C, D, W> Worker<'a, T, C, D, W>
where
    T: Transport,
    C: ClockSource,
    D: Dice,
    W: Write,
{
    /// Creates a worker, taking its start time from `clock`. Shutdown is
    /// driven by the process-wide SIGTERM flag unless replaced with
    /// [`Worker::with_shutdown_flag`].
    pub fn new(
        identity: WorkerIdentity,
        interval: BurstInterval,
        transport: T,
        clock: C,
        dice: D,
        out: W,
    ) -> Self {
        let state = WorkerState::new(identity, clock.now(), interval);
        Self {
            channel: Rendezvous::new(transport, identity.worker_id())
                .cancel_on(signal::shutdown_flag()),
            state,
            clock,
            dice,
            reporter: Reporter::new(out),
            shutdown: signal::shutdown_flag(),
            finished: None,
        }
    }

    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.shutdown = flag;
        self.channel = self.channel.cancel_on(flag);
        self
    }

    #[must_use]
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    #[must_use]
    pub fn into_parts(self) -> (WorkerState, T, W) {
        (
            self.state,
            self.channel.into_inner(),
            self.reporter.into_inner(),
        )
    }

    /// Prints the startup block.
    ///
    /// # Errors
    ///
    /// Returns `Err` if stdout cannot be written.
    pub fn announce(&mut self) -> Result<(), WorkerError> {
        info!(
            pid = self.state.identity.pid,
            limit = self.state.accountant.limit(),
            "worker starting"
        );
        self.reporter.startup(
            &self.state.identity,
            self.state.start,
            self.state.termination,
        )?;
        Ok(())
    }

    /// Runs exactly one iteration of the cycle.
    ///
    /// Once a terminal state is reached every further call returns it
    /// again without touching the channel.
    ///
    /// # Errors
    ///
    /// Any channel failure other than a SIGTERM interruption, or a failed
    /// report write.
    pub fn step(&mut self) -> Result<Step, WorkerError> {
        if let Some(exit) = self.finished {
            return Ok(Step::Finished(exit));
        }
        if self.shutdown.load(Ordering::Relaxed) {
            return self.shut_down();
        }

        let Some(grant) = interruptible(self.shutdown, self.channel.await_grant())? else {
            return self.shut_down();
        };
        self.state.messages_received += 1;

        let now = self.clock.now();
        let received = self.state.messages_received;
        self.reporter.cycle(
            &self.state.identity,
            now,
            self.state.termination,
            received,
        )?;
        if now.has_reached(self.state.termination) {
            self.reporter.deadline_passed(received)?;
        }

        let outcome = self
            .state
            .accountant
            .consume_quantum(grant.quantum, &mut self.dice);
        debug!(
            quantum = grant.quantum,
            ?outcome,
            consumed = self.state.accountant.consumed(),
            "cycle classified"
        );

        let reply = self.channel.reply_to_grant(GrantReply::from(outcome));
        if interruptible(self.shutdown, reply)?.is_none() {
            return self.shut_down();
        }

        if outcome.is_terminal() {
            self.reporter.exiting(&self.state.identity)?;
            let reason = match outcome {
                Outcome::VoluntaryExit { .. } => Completion::VoluntaryExit,
                _ => Completion::BurstExhausted,
            };
            return Ok(self.finish(Exit::Completed { reason }));
        }

        let delta = propose(&self.state.held, &mut self.dice);
        let Some(reply) = interruptible(self.shutdown, self.channel.negotiate(delta))? else {
            return self.shut_down();
        };
        if reply.granted {
            self.state.held.apply(&delta);
        }
        debug!(?delta, granted = reply.granted, held = %self.state.held, "negotiated");

        Ok(Step::Continue {
            outcome,
            delta,
            granted: reply.granted,
        })
    }

    /// Announces the worker and steps until it terminates or shuts down.
    ///
    /// # Errors
    ///
    /// See [`Worker::step`].
    pub fn run(&mut self) -> Result<Summary, WorkerError> {
        self.announce()?;
        let exit = loop {
            if let Step::Finished(exit) = self.step()? {
                break exit;
            }
        };
        info!(?exit, cycles = self.state.messages_received, "worker finished");
        Ok(Summary {
            exit,
            cycles: self.state.messages_received,
            cpu_consumed: self.state.accountant.consumed(),
            held: self.state.held,
        })
    }

    fn shut_down(&mut self) -> Result<Step, WorkerError> {
        warn!(pid = self.state.identity.pid, "shutdown requested");
        self.reporter.sigterm()?;
        Ok(self.finish(Exit::ShutDown))
    }

    fn finish(&mut self, exit: Exit) -> Step {
        self.finished = Some(exit);
        Step::Finished(exit)
    }
}

/// Maps an interruption that coincides with a shutdown request to `None`.
fn interruptible<R>(
    shutdown: &AtomicBool,
    result: Result<R, ChannelError>,
) -> Result<Option<R>, WorkerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ChannelError::Interrupted) if shutdown.load(Ordering::Relaxed) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
