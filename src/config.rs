//! Launch arguments and runtime knobs.

use std::time::Duration;

use crate::{MPIError, Result};

pub const USAGE: &str =
    "Usage: [MPI program name] [task rank] [number of tasks] [name of rendezvous file]";

const ENV_PREFIX: &str = "SOCKET_MPI_";

/// How the coordinator treats barrier bytes that are not the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierPolicy {
    /// Fail with `ProtocolDesyncError`.
    #[default]
    Strict,
    /// Discard the bytes and receive again.
    Tolerant,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Full rescans of the rendezvous file before giving up. `None` means ten per rank.
    pub discovery_attempts: Option<u32>,
    /// Sleep between two rescans.
    pub discovery_interval: Duration,
    /// Delay before the coordinator removes the rendezvous file.
    pub finalize_grace: Duration,
    /// Hostname to publish. `None` uses the machine hostname.
    pub hostname: Option<String>,
    pub barrier_policy: BarrierPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_attempts: None,
            discovery_interval: Duration::from_secs(1),
            finalize_grace: Duration::from_secs(2),
            hostname: None,
            barrier_policy: BarrierPolicy::Strict,
        }
    }
}

impl Config {
    /// Defaults overridden by `SOCKET_MPI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Config::default();

        if let Some(v) = get("DISCOVERY_ATTEMPTS") {
            config.discovery_attempts = Some(parse_env("DISCOVERY_ATTEMPTS", &v)?);
        }
        if let Some(v) = get("DISCOVERY_INTERVAL_MS") {
            config.discovery_interval =
                Duration::from_millis(parse_env("DISCOVERY_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("FINALIZE_GRACE_MS") {
            config.finalize_grace = Duration::from_millis(parse_env("FINALIZE_GRACE_MS", &v)?);
        }
        if let Some(v) = get("HOSTNAME") {
            if !v.is_empty() {
                config.hostname = Some(v);
            }
        }
        if let Some(v) = get("BARRIER_POLICY") {
            config.barrier_policy = match v.to_ascii_lowercase().as_str() {
                "strict" => BarrierPolicy::Strict,
                "tolerant" => BarrierPolicy::Tolerant,
                other => {
                    return Err(MPIError::argument(
                        &[format!("{}BARRIER_POLICY={}", ENV_PREFIX, other)],
                        "barrier policy must be strict or tolerant",
                    ))
                }
            };
        }
        Ok(config)
    }

    /// Rescan budget for a run of `size` processes.
    pub fn discovery_budget(&self, size: usize) -> u32 {
        self.discovery_attempts
            .unwrap_or_else(|| u32::try_from(size).unwrap_or(u32::MAX).saturating_mul(10))
            .max(1)
    }

    pub(crate) fn local_hostname(&self) -> String {
        match &self.hostname {
            Some(h) => h.clone(),
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        MPIError::argument(
            &[format!("{}{}={}", ENV_PREFIX, name, value)],
            format!("{}{} is not a valid number", ENV_PREFIX, name),
        )
    })
}

/// The four positional arguments every launched process receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub rank: usize,
    pub size: usize,
    pub rendezvous_path: String,
}

impl LaunchArgs {
    /// Parse `[program, rank, size, rendezvous path]`.
    ///
    /// Any deviation yields an `ArgumentError` carrying every argument received, so the
    /// caller can print them next to the usage string before exiting.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.len() != 4 {
            return Err(MPIError::argument(&args, "expected exactly 3 arguments after the program name"));
        }

        let rank: i64 = args[1]
            .parse()
            .map_err(|_| MPIError::argument(&args, "task rank must be a number"))?;
        if rank < 0 {
            return Err(MPIError::argument(&args, "task rank must be non-negative"));
        }
        let size: i64 = args[2]
            .parse()
            .map_err(|_| MPIError::argument(&args, "number of tasks must be a number"))?;
        if size <= 0 {
            return Err(MPIError::argument(&args, "number of tasks must be positive"));
        }
        if rank >= size {
            return Err(MPIError::argument(&args, "task rank must be below the number of tasks"));
        }
        let path = &args[3];
        if path.is_empty() || path.parse::<i64>().is_ok() {
            return Err(MPIError::argument(&args, "rendezvous file name must not be a number"));
        }

        Ok(LaunchArgs {
            rank: rank as usize,
            size: size as usize,
            rendezvous_path: path.clone(),
        })
    }
}
