//! Worker process.
//!
//! Spawned by the orchestrator with the run interval and the identifiers of
//! the shared clock segment and message queue:
//!
//! ```sh
//! worker <seconds> <nanoseconds> <shm_id> <msq_id>
//! ```
//!
//! Report lines go to stdout. Fatal errors go to stderr prefixed `WORKER:`,
//! next to tracing diagnostics filtered by `RUST_LOG`. Set
//! `OSSIM_WORKER_SEED` to replay a run.
//!
//! # Signals
//!
//! - `SIGTERM`: stop at the next blocking point, detach and exit 0

use std::io;

use ossim::clock::SimClock;
use ossim::config::{ConfigError, WorkerConfig};
use ossim::dice::SeededDice;
use ossim::ipc::msgq::MsgQueue;
use ossim::ipc::shmem::{Opener, Shm};
use ossim::report::USAGE;
use ossim::{Summary, Worker, WorkerError, WorkerIdentity, signal};

fn main() {
    ossim::init_tracing();

    if let Err(e) = run() {
        match &e {
            WorkerError::Config(ConfigError::NotEnoughArguments { .. }) => {
                eprintln!("[ERROR] Not enough arguments provided.");
                println!("{USAGE}");
            }
            WorkerError::Shm(err) => eprintln!("WORKER: shmat failed: {err}"),
            _ => eprintln!("WORKER: {e}"),
        }
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<Summary, WorkerError> {
    let config = WorkerConfig::from_env()?;
    signal::install_sigterm_handler().map_err(WorkerError::Signal)?;

    let identity = WorkerIdentity::current();
    let clock = Shm::<SimClock, Opener>::attach(config.shm_id)?;
    let queue = MsgQueue::<Opener>::open(config.msq_id)?;
    let seed = config
        .seed
        .unwrap_or_else(|| SeededDice::seed_for(identity.pid));

    let mut worker = Worker::new(
        identity,
        config.interval,
        queue,
        &clock,
        SeededDice::new(seed),
        io::stdout().lock(),
    );
    worker.run()
}
