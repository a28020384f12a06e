//! Runs one submission: stage it, execute it in the sandbox, grade the output.

use log::{info, warn};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::compare::{self, ComparePolicy};
use crate::config::Config;
use crate::language::LanguageParams;
use crate::models::{Problem, Submission, SubmissionId, SubmissionStatus};
use crate::sandbox::{Cancellation, ExecuteRequest, RunResult, Sandbox, SandboxError};

const INPUT_NAME: &str = "input";
const COMPILE_TIME_LIMIT: Duration = Duration::from_secs(25);
// 1GiB
const COMPILE_MEMORY_LIMIT_KIB: u64 = 1_024 * 1_024;
const COMPILE_PROCESS_LIMIT: u32 = 40;

/// Staging could not happen. Never the contestant's fault.
#[derive(Error, Debug)]
pub enum BuildFailure {
    #[error("unsupported language {0:?}")]
    UnknownLanguage(String),
    #[error("working directory {0:?} is already in use")]
    WorkdirInUse(PathBuf),
    #[error("couldn't create working directory {path:?}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't read source {path:?}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("problem {0} reads input but has no input file")]
    MissingInput(i32),
    #[error("couldn't stage {path:?}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Build(#[from] BuildFailure),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("couldn't read expected output {path:?}")]
    ExpectedOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Did the sandboxed program execute cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Success,
    RunFailure,
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputType::Success => f.write_str("success"),
            OutputType::RunFailure => f.write_str("run_failure"),
        }
    }
}

/// Was the output of a clean run correct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Passed,
    Failed,
}

/// Classified outcome of one execution.
///
/// `output_type` and `run_succeeded` describe whether the program ran;
/// `grade` is only present when it did.
#[derive(Clone, Debug, PartialEq)]
pub struct Judgement {
    pub output_type: OutputType,
    pub run_succeeded: bool,
    pub grade: Option<Grade>,
    pub run: RunResult,
}

impl Judgement {
    /// Grades `run` against `expected`, which is only looked at for clean runs.
    pub fn classify(run: RunResult, expected: Option<&[u8]>, policy: ComparePolicy) -> Self {
        if !run.success() {
            return Judgement {
                output_type: OutputType::RunFailure,
                run_succeeded: false,
                grade: None,
                run,
            };
        }

        let grade = match expected {
            Some(expected) if compare::equal(&run.stdout, expected, policy) => Grade::Passed,
            _ => Grade::Failed,
        };
        Judgement {
            output_type: OutputType::Success,
            run_succeeded: true,
            grade: Some(grade),
            run,
        }
    }

    /// The program's output, for display.
    pub fn output(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.run.stdout)
    }

    /// Terminal status to record, or `None` when a human has to decide.
    pub fn status(&self, auto_judge: bool) -> Option<SubmissionStatus> {
        match (self.grade, auto_judge) {
            (None, _) => Some(SubmissionStatus::RunFailure),
            (Some(_), false) => None,
            (Some(Grade::Passed), true) => Some(SubmissionStatus::Passed),
            (Some(Grade::Failed), true) => Some(SubmissionStatus::Failed),
        }
    }
}

/// Working directory owned by one judging attempt; removed on drop.
#[derive(Debug)]
pub struct Workdir {
    path: PathBuf,
}

impl Workdir {
    fn create(root: &Path, id: SubmissionId) -> Result<Workdir, BuildFailure> {
        fs::create_dir_all(root).map_err(|source| BuildFailure::Workdir {
            path: root.to_path_buf(),
            source,
        })?;

        // Only one attempt per submission runs at a time, so a directory
        // already there was left behind by a crash.
        let path = root.join(id.to_string());
        if path.exists() {
            warn!("Removing stale working directory {:?}", path);
            fs::remove_dir_all(&path).map_err(|source| BuildFailure::Workdir {
                path: path.clone(),
                source,
            })?;
        }
        match fs::create_dir(&path) {
            Ok(()) => Ok(Workdir { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(BuildFailure::WorkdirInUse(path))
            }
            Err(source) => Err(BuildFailure::Workdir { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if let Err(e) = fs_extra::dir::remove(&self.path) {
            warn!("Couldn't remove working directory {:?}: {}", self.path, e);
        }
    }
}

/// A staged submission, ready to run.
pub struct BuildContext {
    pub submission_id: SubmissionId,
    pub workdir: Workdir,
    pub language: LanguageParams,
    pub stdin_path: Option<PathBuf>,
    pub time_limit: Duration,
    pub expected_output_path: PathBuf,
    pub policy: ComparePolicy,
}

pub struct SubmissionRunner {
    sandbox: Arc<dyn Sandbox>,
    languages: Arc<HashMap<String, LanguageParams>>,
    work_dir: PathBuf,
    default_timeout: Duration,
    memory_limit_kib: u64,
}

impl SubmissionRunner {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        languages: HashMap<String, LanguageParams>,
        config: &Config,
    ) -> Self {
        SubmissionRunner {
            sandbox,
            languages: Arc::new(languages),
            work_dir: config.work_dir.clone(),
            default_timeout: config.default_timeout,
            memory_limit_kib: config.memory_limit_kib,
        }
    }

    pub fn languages(&self) -> &HashMap<String, LanguageParams> {
        &self.languages
    }

    /// Stages the submission into its own working directory.
    pub fn build(
        &self,
        submission: &Submission,
        problem: &Problem,
    ) -> Result<BuildContext, BuildFailure> {
        let language = self
            .languages
            .get(&submission.language)
            .ok_or_else(|| BuildFailure::UnknownLanguage(submission.language.clone()))?
            .clone();

        let workdir = Workdir::create(&self.work_dir, submission.id)?;

        let source_bytes = fs::read(&submission.source_path).map_err(|source| BuildFailure::Source {
            path: submission.source_path.clone(),
            source,
        })?;
        let source_text = language.transform_source(String::from_utf8_lossy(&source_bytes).into());
        let source_path = workdir.path().join(language.source_name());
        fs::write(&source_path, source_text).map_err(|source| BuildFailure::Stage {
            path: source_path.clone(),
            source,
        })?;

        let stdin_path = if problem.has_input {
            let input_path = problem
                .stdin_path()
                .ok_or(BuildFailure::MissingInput(problem.id))?;
            let staged = workdir.path().join(INPUT_NAME);
            fs::copy(input_path, &staged).map_err(|source| BuildFailure::Stage {
                path: input_path.clone(),
                source,
            })?;
            Some(staged)
        } else {
            None
        };

        info!(
            "Staged submission {} ({}) in {:?}",
            submission.id, language.name, workdir.path()
        );

        Ok(BuildContext {
            submission_id: submission.id,
            workdir,
            language,
            stdin_path,
            time_limit: problem.time_limit(self.default_timeout),
            expected_output_path: problem.output_path.clone(),
            policy: problem.compare_policy(),
        })
    }

    /// Compiles if needed, then runs the staged program once.
    ///
    /// A failed compilation comes back as the unsuccessful [`RunResult`] of
    /// the compiler.
    pub fn run(
        &self,
        context: &BuildContext,
        cancellation: &Cancellation,
    ) -> Result<RunResult, SandboxError> {
        if let Some(command) = context.language.compile_command() {
            if cancellation.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            let compile = self.sandbox.execute(&ExecuteRequest {
                workdir: context.workdir.path(),
                command: &command,
                stdin_path: None,
                time_limit: COMPILE_TIME_LIMIT,
                memory_limit_kib: COMPILE_MEMORY_LIMIT_KIB,
                limit_address_space: context.language.limit_address_space,
                process_limit: COMPILE_PROCESS_LIMIT,
                cancellation,
            })?;
            info!(
                "Compiled submission {}: exit {:?}",
                context.submission_id, compile.exit_code
            );
            if !compile.success() {
                return Ok(compile);
            }
        }

        if cancellation.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let command = context.language.run_command();
        self.sandbox.execute(&ExecuteRequest {
            workdir: context.workdir.path(),
            command: &command,
            stdin_path: context.stdin_path.as_deref(),
            time_limit: context.time_limit,
            memory_limit_kib: self.memory_limit_kib,
            limit_address_space: context.language.limit_address_space,
            process_limit: context.language.process_limit,
            cancellation,
        })
    }

    /// `build`, `run`, then grade against the problem's expected output.
    pub fn call(
        &self,
        submission: &Submission,
        problem: &Problem,
        cancellation: &Cancellation,
    ) -> Result<Judgement, RunnerError> {
        let context = self.build(submission, problem)?;
        let run = self.run(&context, cancellation)?;

        let expected = if run.success() {
            Some(fs::read(&context.expected_output_path).map_err(|source| {
                RunnerError::ExpectedOutput {
                    path: context.expected_output_path.clone(),
                    source,
                }
            })?)
        } else {
            None
        };

        Ok(Judgement::classify(run, expected.as_deref(), context.policy))
    }
}
