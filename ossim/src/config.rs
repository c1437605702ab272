//! Worker configuration from the command line and environment.
//!
//! ```text
//! worker <seconds> <nanoseconds> <shm_id> <msq_id>
//! ```
//!
//! `OSSIM_WORKER_SEED` optionally pins the random seed.

use std::str::FromStr;

use thiserror::Error;

use crate::clock::BurstInterval;
use crate::ipc::msgq::MsqId;
use crate::ipc::shmem::ShmId;

/// Environment variable that pins the RNG seed.
pub const SEED_ENV: &str = "OSSIM_WORKER_SEED";

/// Positional arguments after the program name.
const REQUIRED_ARGS: usize = 4;

/// Errors in the command line or environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Fewer than four positional arguments.
    #[error("not enough arguments provided: expected {REQUIRED_ARGS}, got {given}")]
    NotEnoughArguments { given: usize },
    /// An argument did not parse.
    #[error("invalid {name} `{value}`")]
    InvalidArgument { name: &'static str, value: String },
    /// Both interval fields were zero, leaving no CPU burst to run.
    #[error("burst interval must be longer than zero")]
    ZeroInterval,
    /// The seed variable did not hold a `u64`.
    #[error("invalid {SEED_ENV} `{0}`")]
    InvalidSeed(String),
}

/// Everything a worker needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Run time on the simulated clock, and the CPU burst limit.
    pub interval: BurstInterval,
    /// Segment holding the simulated clock.
    pub shm_id: ShmId,
    /// Queue shared with the orchestrator.
    pub msq_id: MsqId,
    /// Fixed RNG seed; derived from time and pid when absent.
    pub seed: Option<u64>,
}

impl WorkerConfig {
    /// Parses `args` as received by `main` (program name first). Arguments
    /// past the fourth are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if arguments are missing, malformed, or describe a
    /// zero-length interval.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let positional = args.get(1..).unwrap_or_default();
        if positional.len() < REQUIRED_ARGS {
            return Err(ConfigError::NotEnoughArguments {
                given: positional.len(),
            });
        }

        let seconds = parse_arg::<u32>("seconds", &positional[0])?;
        let nanoseconds = parse_arg::<u32>("nanoseconds", &positional[1])?;
        let shm_id = parse_arg::<i32>("shm_id", &positional[2])?;
        let msq_id = parse_arg::<i32>("msq_id", &positional[3])?;

        let interval = BurstInterval::new(seconds, nanoseconds);
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }

        Ok(Self {
            interval,
            shm_id: ShmId::new(shm_id),
            msq_id: MsqId::new(msq_id),
            seed: None,
        })
    }

    /// Reads the process arguments and [`SEED_ENV`].
    ///
    /// # Errors
    ///
    /// See [`WorkerConfig::from_args`]; also fails on an unparsable seed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        let config = Self::from_args(&args)?;
        match std::env::var(SEED_ENV) {
            Ok(raw) => config.with_seed(&raw),
            Err(_) => Ok(config),
        }
    }

    /// Pins the seed from its textual form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSeed`] if `raw` is not a `u64`.
    pub fn with_seed(mut self, raw: &str) -> Result<Self, ConfigError> {
        let seed = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidSeed(raw.to_string()))?;
        self.seed = Some(seed);
        Ok(self)
    }
}

fn parse_arg<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidArgument {
            name,
            value: value.to_string(),
        })
}
