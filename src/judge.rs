//! Judging pipeline: one submission in, one persisted verdict out.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{
    Submission, SubmissionCompletion, SubmissionId, SubmissionResult, SubmissionStatus,
};
use crate::runner::{Judgement, RunnerError, SubmissionRunner};
use crate::sandbox::{Cancellation, SandboxError};
use crate::store::{StoreError, SubmissionStore};

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("submission {0} is already being judged")]
    InFlight(SubmissionId),
    #[error("submission {0} was already judged as {1}")]
    AlreadyJudged(SubmissionId, SubmissionStatus),
    #[error("submission {0} already ran and awaits review")]
    AwaitingReview(SubmissionId),
    #[error("judging of submission {0} was cancelled")]
    Cancelled(SubmissionId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl JudgeError {
    /// Faults of the judge itself, as opposed to refused or aborted requests.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, JudgeError::Store(_) | JudgeError::Runner(_))
    }
}

/// Sent after a verdict has been persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VerdictEvent {
    pub submission_id: SubmissionId,
    pub team_id: i32,
    pub problem_id: i32,
    pub status: SubmissionStatus,
}

#[derive(Clone, Debug)]
pub struct Verdict {
    pub submission_id: SubmissionId,
    /// `Pending` when the result awaits review.
    pub status: SubmissionStatus,
    pub judgement: Judgement,
}

/// Claim on a submission id, released on drop.
struct Claim<'a> {
    in_flight: &'a DashMap<SubmissionId, Cancellation>,
    id: SubmissionId,
    cancellation: Cancellation,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

pub struct Judge<S: ?Sized> {
    runner: SubmissionRunner,
    in_flight: DashMap<SubmissionId, Cancellation>,
    events: broadcast::Sender<VerdictEvent>,
    store: Arc<S>,
}

impl<S: SubmissionStore + ?Sized> Judge<S> {
    pub fn new(store: Arc<S>, runner: SubmissionRunner) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Judge {
            runner,
            in_flight: DashMap::new(),
            events,
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VerdictEvent> {
        self.events.subscribe()
    }

    fn claim(&self, id: SubmissionId) -> Result<Claim<'_>, JudgeError> {
        match self.in_flight.entry(id) {
            Entry::Occupied(_) => Err(JudgeError::InFlight(id)),
            Entry::Vacant(entry) => {
                let cancellation = Cancellation::new();
                entry.insert(cancellation.clone());
                Ok(Claim {
                    in_flight: &self.in_flight,
                    id,
                    cancellation,
                })
            }
        }
    }

    fn publish(&self, submission: &Submission, status: SubmissionStatus) {
        // nobody listening is fine
        let _ = self.events.send(VerdictEvent {
            submission_id: submission.id,
            team_id: submission.team_id,
            problem_id: submission.problem_id,
            status,
        });
    }

    pub fn is_in_flight(&self, id: SubmissionId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Signals the in-flight attempt for `id`, if any.
    ///
    /// The attempt kills its processes, removes its working directory and
    /// leaves the submission pending.
    pub fn cancel(&self, id: SubmissionId) -> bool {
        match self.in_flight.get(&id) {
            Some(cancellation) => {
                info!("Cancelling submission {}", id);
                cancellation.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs a pending submission once and persists its verdict. Blocks.
    pub fn judge(&self, id: SubmissionId) -> Result<Verdict, JudgeError> {
        let claim = self.claim(id)?;

        let submission = self.store.submission(id)?;
        if submission.status.is_terminal() {
            return Err(JudgeError::AlreadyJudged(id, submission.status));
        }
        if self.store.result(id)?.is_some() {
            return Err(JudgeError::AwaitingReview(id));
        }
        let problem = self.store.problem(submission.problem_id)?;

        info!(
            "Judging submission {} of team {} for problem {}",
            id, submission.team_id, problem.label
        );
        let judgement = match self.runner.call(&submission, &problem, &claim.cancellation) {
            Ok(judgement) => judgement,
            Err(RunnerError::Sandbox(SandboxError::Cancelled)) => {
                warn!("Judging of submission {} was cancelled", id);
                return Err(JudgeError::Cancelled(id));
            }
            Err(e) => {
                error!("Couldn't judge submission {}: {}", id, e);
                return Err(e.into());
            }
        };

        let status = judgement.status(problem.auto_judge);
        let run = &judgement.run;
        self.store.complete(SubmissionCompletion {
            id,
            status,
            runtime_ms: run.time_wall_ms,
            result: SubmissionResult {
                submission_id: id,
                output: String::from_utf8_lossy(&run.stdout).into_owned(),
                error_output: String::from_utf8_lossy(&run.stderr).into_owned(),
                exit_code: run.exit_code,
                exit_signal: run.exit_signal,
                timed_out: run.timed_out,
            },
        })?;

        let status = match status {
            Some(status) => {
                info!("Submission {} judged {} in {}ms", id, status, run.time_wall_ms);
                self.publish(&submission, status);
                status
            }
            None => {
                info!("Submission {} ran cleanly and awaits review", id);
                SubmissionStatus::Pending
            }
        };

        Ok(Verdict {
            submission_id: id,
            status,
            judgement,
        })
    }

    /// Settles a submission whose clean run is awaiting review.
    pub fn review(&self, id: SubmissionId, passed: bool) -> Result<SubmissionStatus, JudgeError> {
        let _claim = self.claim(id)?;

        let submission = self.store.submission(id)?;
        if submission.status.is_terminal() {
            return Err(JudgeError::AlreadyJudged(id, submission.status));
        }

        let status = if passed {
            SubmissionStatus::Passed
        } else {
            SubmissionStatus::Failed
        };
        self.store.review(id, status)?;
        info!("Submission {} reviewed as {}", id, status);
        self.publish(&submission, status);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::language::get_supported_languages;
    use crate::models::{Contest, NewSubmission, Problem};
    use crate::sandbox::{ExecuteRequest, RunResult, Sandbox};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Answers every execution with a canned result.
    struct CannedSandbox {
        result: RunResult,
        hold_until_cancelled: bool,
        seen_workdirs: Mutex<Vec<PathBuf>>,
    }

    impl CannedSandbox {
        fn new(result: RunResult) -> Self {
            CannedSandbox {
                result,
                hold_until_cancelled: false,
                seen_workdirs: Mutex::new(vec![]),
            }
        }
    }

    impl Sandbox for CannedSandbox {
        fn execute(&self, request: &ExecuteRequest) -> Result<RunResult, SandboxError> {
            self.seen_workdirs
                .lock()
                .unwrap()
                .push(request.workdir.to_path_buf());
            if self.hold_until_cancelled {
                while !request.cancellation.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                return Err(SandboxError::Cancelled);
            }
            Ok(self.result.clone())
        }
    }

    fn clean(stdout: &str) -> RunResult {
        RunResult {
            stdout: stdout.into(),
            exit_code: Some(0),
            time_wall_ms: 40,
            ..RunResult::default()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        sandbox: Arc<CannedSandbox>,
        judge: Arc<Judge<MemoryStore>>,
    }

    fn fixture(sandbox: CannedSandbox, auto_judge: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("expected"), "6\n").unwrap();
        fs::write(dir.path().join("source.py"), "print(int(input()) * 2)\n").unwrap();

        let store = Arc::new(MemoryStore::new());
        store.insert_contest(Contest {
            id: 1,
            name: "Warmup".into(),
            start_instant: None,
            end_instant: None,
        });
        store.insert_problem(Problem {
            id: 1,
            contest_id: 1,
            label: "A".into(),
            name: "Double".into(),
            output_path: dir.path().join("expected"),
            input_path: None,
            timeout: None,
            whitespace_rule: Default::default(),
            ignore_case: false,
            auto_judge,
            has_input: false,
        });

        let config = Config {
            work_dir: dir.path().join("work"),
            ..Config::default()
        };
        let sandbox = Arc::new(sandbox);
        let runner = SubmissionRunner::new(sandbox.clone(), get_supported_languages(), &config);
        let judge = Arc::new(Judge::new(store.clone(), runner));
        Fixture {
            dir,
            store,
            sandbox,
            judge,
        }
    }

    fn submit(fixture: &Fixture) -> SubmissionId {
        fixture.store.insert_submission(Submission::new(NewSubmission {
            team_id: 1,
            problem_id: 1,
            language: "python.3".into(),
            source_path: fixture.dir.path().join("source.py"),
            submission_instant: NaiveDate::from_ymd(2021, 9, 18).and_hms(13, 5, 0),
        }))
    }

    #[test]
    fn matching_output_passes_and_is_broadcast() {
        let fixture = fixture(CannedSandbox::new(clean("6\n")), true);
        let mut events = fixture.judge.subscribe();
        let id = submit(&fixture);

        let verdict = fixture.judge.judge(id).unwrap();
        assert_eq!(verdict.status, SubmissionStatus::Passed);

        let submission = fixture.store.submission(id).unwrap();
        assert_eq!(submission.status, SubmissionStatus::Passed);
        assert_eq!(submission.runtime_ms, Some(40));
        assert_eq!(fixture.store.result(id).unwrap().unwrap().output, "6\n");

        let event = events.try_recv().unwrap();
        assert_eq!(event.submission_id, id);
        assert_eq!(event.status, SubmissionStatus::Passed);

        let workdirs = fixture.sandbox.seen_workdirs.lock().unwrap();
        assert!(workdirs[0].ends_with(id.to_string()));
        assert!(!workdirs[0].exists());
    }

    #[test]
    fn judged_submissions_are_not_run_again() {
        let fixture = fixture(CannedSandbox::new(clean("7\n")), true);
        let id = submit(&fixture);

        assert_eq!(
            fixture.judge.judge(id).unwrap().status,
            SubmissionStatus::Failed
        );
        assert!(matches!(
            fixture.judge.judge(id),
            Err(JudgeError::AlreadyJudged(_, SubmissionStatus::Failed))
        ));
        assert_eq!(fixture.sandbox.seen_workdirs.lock().unwrap().len(), 1);
    }

    #[test]
    fn crashed_runs_are_run_failures() {
        let crashed = RunResult {
            stdout: "6\n".into(),
            stderr: "Traceback (most recent call last):\n".into(),
            exit_code: Some(1),
            ..RunResult::default()
        };
        let fixture = fixture(CannedSandbox::new(crashed), false);
        let id = submit(&fixture);

        let verdict = fixture.judge.judge(id).unwrap();
        assert_eq!(verdict.status, SubmissionStatus::RunFailure);
        assert!(!verdict.judgement.run_succeeded);
        assert_eq!(
            fixture.store.result(id).unwrap().unwrap().error_output,
            "Traceback (most recent call last):\n"
        );
    }

    #[test]
    fn manual_problems_wait_for_review() {
        let fixture = fixture(CannedSandbox::new(clean("6\n")), false);
        let id = submit(&fixture);

        let verdict = fixture.judge.judge(id).unwrap();
        assert_eq!(verdict.status, SubmissionStatus::Pending);
        assert!(verdict.judgement.run_succeeded);
        assert_eq!(
            fixture.store.submission(id).unwrap().status,
            SubmissionStatus::Pending
        );
        assert!(fixture.store.result(id).unwrap().is_some());

        // the stored run is kept until somebody reviews it
        let error = fixture.judge.judge(id).unwrap_err();
        assert!(matches!(error, JudgeError::AwaitingReview(_)));
        assert!(!error.is_infrastructure());
        assert_eq!(fixture.sandbox.seen_workdirs.lock().unwrap().len(), 1);

        assert_eq!(
            fixture.judge.review(id, false).unwrap(),
            SubmissionStatus::Failed
        );
        assert!(matches!(
            fixture.judge.review(id, true),
            Err(JudgeError::AlreadyJudged(..))
        ));
    }

    #[test]
    fn staging_faults_leave_the_submission_pending() {
        let fixture = fixture(CannedSandbox::new(clean("6\n")), true);
        let id = fixture.store.insert_submission(Submission::new(NewSubmission {
            team_id: 1,
            problem_id: 1,
            language: "brainfuck".into(),
            source_path: fixture.dir.path().join("source.py"),
            submission_instant: NaiveDate::from_ymd(2021, 9, 18).and_hms(13, 5, 0),
        }));

        let error = fixture.judge.judge(id).unwrap_err();
        assert!(error.is_infrastructure());
        assert_eq!(
            fixture.store.submission(id).unwrap().status,
            SubmissionStatus::Pending
        );
        assert!(!fixture.judge.is_in_flight(id));
    }

    #[test]
    fn one_attempt_in_flight_and_cancellable() {
        let mut sandbox = CannedSandbox::new(clean("6\n"));
        sandbox.hold_until_cancelled = true;
        let fixture = fixture(sandbox, true);
        let id = submit(&fixture);

        let judge = fixture.judge.clone();
        let attempt = thread::spawn(move || judge.judge(id));
        while !fixture.judge.is_in_flight(id) {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            fixture.judge.judge(id),
            Err(JudgeError::InFlight(_))
        ));
        assert!(fixture.judge.cancel(id));
        assert!(matches!(
            attempt.join().unwrap(),
            Err(JudgeError::Cancelled(_))
        ));

        assert!(!fixture.judge.cancel(id));
        assert_eq!(
            fixture.store.submission(id).unwrap().status,
            SubmissionStatus::Pending
        );
        assert!(fixture.store.result(id).unwrap().is_none());
        let workdir = fixture.sandbox.seen_workdirs.lock().unwrap()[0].clone();
        assert!(!workdir.exists());
    }
}
