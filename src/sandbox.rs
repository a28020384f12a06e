//! The execution facility every language runner goes through.
//!
//! A [`Sandbox`] receives a staged working directory, a command, an optional
//! stdin file and limits, and hands back raw evidence of the run. It never
//! interprets correctness. Faults caused by the executed program (non-zero
//! exit, signal, timeout) come back inside [`RunResult`]; only faults of the
//! facility itself are [`SandboxError`]s.

pub mod isolate;
pub mod process;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use self::isolate::IsolateSandbox;
pub use self::process::ProcessSandbox;

#[derive(Clone, Debug, PartialEq)]
pub struct CommandTuple {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("couldn't prepare the run")]
    Io(#[source] io::Error),
    #[error("couldn't start {binary_path:?}")]
    Spawn {
        binary_path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("isolate failed: {0}")]
    IsolateCommandFailed(String),
    #[error("no free isolate box")]
    NoFreeBox,
    #[error("run was cancelled")]
    Cancelled,
}

/// Shared flag used to abort an in-flight run.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ExecuteRequest<'a> {
    /// Directory the program runs in; nothing outside it is writable.
    pub workdir: &'a Path,
    pub command: &'a CommandTuple,
    pub stdin_path: Option<&'a Path>,
    pub time_limit: Duration,
    pub memory_limit_kib: u64,
    /// Whether the memory limit also caps the address space. Runtimes that
    /// reserve far more than they touch bound their heap with flags instead.
    pub limit_address_space: bool,
    pub process_limit: u32,
    pub cancellation: &'a Cancellation,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunResult {
    /// Raw bytes the program wrote; graded without any decoding.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
    pub time_wall_ms: u64,
}

impl RunResult {
    /// True iff the program exited with status zero within its time limit.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait Sandbox: Send + Sync {
    fn execute(&self, request: &ExecuteRequest) -> Result<RunResult, SandboxError>;
}

pub(crate) fn read_output(path: &Path) -> Result<Vec<u8>, SandboxError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(vec![]),
        Err(e) => Err(SandboxError::Io(e)),
    }
}
