use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::sandbox::{IsolateSandbox, ProcessSandbox, Sandbox};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("isolate executable not found")]
    IsolateNotFound(#[source] which::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxKind {
    Process,
    Isolate,
}

impl FromStr for SandboxKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "process" => Ok(SandboxKind::Process),
            "isolate" => Ok(SandboxKind::Isolate),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub work_dir: PathBuf,
    pub workers: usize,
    pub sandbox: SandboxKind,
    pub default_timeout: Duration,
    pub memory_limit_kib: u64,
    pub penalty_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: PathBuf::from("./work"),
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            sandbox: SandboxKind::Process,
            default_timeout: Duration::from_secs(5),
            memory_limit_kib: 262_144,
            penalty_minutes: 20,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    /// Reads `JUDGE_*` variables, loading a `.env` file first if present.
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let workers = parse_var(&lookup, "JUDGE_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                var: "JUDGE_WORKERS",
                value: workers.to_string(),
            });
        }
        // a zero limit would time every run out before it starts
        let default_timeout = parse_var(
            &lookup,
            "JUDGE_DEFAULT_TIMEOUT",
            defaults.default_timeout.as_secs(),
        )?;
        if default_timeout == 0 {
            return Err(ConfigError::Invalid {
                var: "JUDGE_DEFAULT_TIMEOUT",
                value: default_timeout.to_string(),
            });
        }

        Ok(Config {
            work_dir: lookup("JUDGE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            workers,
            sandbox: parse_var(&lookup, "JUDGE_SANDBOX", defaults.sandbox)?,
            default_timeout: Duration::from_secs(default_timeout),
            memory_limit_kib: parse_var(
                &lookup,
                "JUDGE_MEMORY_LIMIT_KIB",
                defaults.memory_limit_kib,
            )?,
            penalty_minutes: parse_var(
                &lookup,
                "JUDGE_PENALTY_MINUTES",
                defaults.penalty_minutes,
            )?,
        })
    }

    /// The configured sandbox; isolate gets one box per worker.
    pub fn sandbox(&self) -> Result<Arc<dyn Sandbox>, ConfigError> {
        Ok(match self.sandbox {
            SandboxKind::Process => Arc::new(ProcessSandbox::new()),
            SandboxKind::Isolate => Arc::new(
                IsolateSandbox::locate(self.workers as i32)
                    .map_err(ConfigError::IsolateNotFound)?,
            ),
        })
    }
}
