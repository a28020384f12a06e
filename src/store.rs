//! Where contests, problems, teams and submissions live.
//!
//! The judging core only sees the [`SubmissionStore`] trait. [`MemoryStore`]
//! backs the worker binary and the tests.

use dashmap::DashMap;
use thiserror::Error;

use crate::models::{
    Contest, Problem, Submission, SubmissionCompletion, SubmissionId, SubmissionResult,
    SubmissionStatus, Team,
};

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("no contest with id {0}")]
    UnknownContest(i32),
    #[error("no problem with id {0}")]
    UnknownProblem(i32),
    #[error("no submission with id {0}")]
    UnknownSubmission(SubmissionId),
    #[error("submission {0} is already {1}")]
    NotPending(SubmissionId, SubmissionStatus),
    #[error("submission {0} already has a result")]
    ResultExists(SubmissionId),
    #[error("submission {0} has no result to review")]
    NoResult(SubmissionId),
    #[error("{0} is not a verdict")]
    NotTerminal(SubmissionStatus),
}

pub trait SubmissionStore: Send + Sync {
    fn contest(&self, id: i32) -> Result<Contest, StoreError>;
    /// Problems of a contest, ordered by id.
    fn problems(&self, contest_id: i32) -> Result<Vec<Problem>, StoreError>;
    fn teams(&self, contest_id: i32) -> Result<Vec<Team>, StoreError>;
    /// Submissions to the problems of a contest, oldest first.
    fn submissions(&self, contest_id: i32) -> Result<Vec<Submission>, StoreError>;
    fn problem(&self, id: i32) -> Result<Problem, StoreError>;
    fn submission(&self, id: SubmissionId) -> Result<Submission, StoreError>;
    fn result(&self, id: SubmissionId) -> Result<Option<SubmissionResult>, StoreError>;

    /// Records the result of the one execution of a pending submission and,
    /// when given, its terminal status.
    fn complete(&self, completion: SubmissionCompletion) -> Result<(), StoreError>;

    /// Settles a pending submission that already has a result.
    fn review(&self, id: SubmissionId, status: SubmissionStatus) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    contests: DashMap<i32, Contest>,
    problems: DashMap<i32, Problem>,
    teams: DashMap<i32, Team>,
    submissions: DashMap<SubmissionId, Submission>,
    results: DashMap<SubmissionId, SubmissionResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_contest(&self, contest: Contest) {
        self.contests.insert(contest.id, contest);
    }

    pub fn insert_problem(&self, problem: Problem) {
        self.problems.insert(problem.id, problem);
    }

    pub fn insert_team(&self, team: Team) {
        self.teams.insert(team.id, team);
    }

    pub fn insert_submission(&self, submission: Submission) -> SubmissionId {
        let id = submission.id;
        self.submissions.insert(id, submission);
        id
    }
}

impl SubmissionStore for MemoryStore {
    fn contest(&self, id: i32) -> Result<Contest, StoreError> {
        self.contests
            .get(&id)
            .map(|contest| contest.clone())
            .ok_or(StoreError::UnknownContest(id))
    }

    fn problems(&self, contest_id: i32) -> Result<Vec<Problem>, StoreError> {
        self.contest(contest_id)?;
        let mut problems: Vec<Problem> = self
            .problems
            .iter()
            .filter(|problem| problem.contest_id == contest_id)
            .map(|problem| problem.clone())
            .collect();
        problems.sort_by_key(|problem| problem.id);
        Ok(problems)
    }

    fn teams(&self, contest_id: i32) -> Result<Vec<Team>, StoreError> {
        self.contest(contest_id)?;
        let mut teams: Vec<Team> = self
            .teams
            .iter()
            .filter(|team| team.contest_id == contest_id)
            .map(|team| team.clone())
            .collect();
        teams.sort_by_key(|team| team.id);
        Ok(teams)
    }

    fn submissions(&self, contest_id: i32) -> Result<Vec<Submission>, StoreError> {
        let problem_ids: Vec<i32> = self
            .problems(contest_id)?
            .iter()
            .map(|problem| problem.id)
            .collect();
        let mut submissions: Vec<Submission> = self
            .submissions
            .iter()
            .filter(|submission| problem_ids.contains(&submission.problem_id))
            .map(|submission| submission.clone())
            .collect();
        submissions.sort_by_key(|submission| (submission.submission_instant, submission.id));
        Ok(submissions)
    }

    fn problem(&self, id: i32) -> Result<Problem, StoreError> {
        self.problems
            .get(&id)
            .map(|problem| problem.clone())
            .ok_or(StoreError::UnknownProblem(id))
    }

    fn submission(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.submissions
            .get(&id)
            .map(|submission| submission.clone())
            .ok_or(StoreError::UnknownSubmission(id))
    }

    fn result(&self, id: SubmissionId) -> Result<Option<SubmissionResult>, StoreError> {
        self.submission(id)?;
        Ok(self.results.get(&id).map(|result| result.clone()))
    }

    fn complete(&self, completion: SubmissionCompletion) -> Result<(), StoreError> {
        let SubmissionCompletion {
            id,
            status,
            runtime_ms,
            result,
        } = completion;

        if let Some(status) = status {
            if !status.is_terminal() {
                return Err(StoreError::NotTerminal(status));
            }
        }

        // holding the submission entry serialises writers of the same id
        let mut submission = self
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::UnknownSubmission(id))?;
        if submission.status.is_terminal() {
            return Err(StoreError::NotPending(id, submission.status));
        }
        if self.results.contains_key(&id) {
            return Err(StoreError::ResultExists(id));
        }

        self.results.insert(id, result);
        submission.runtime_ms = Some(runtime_ms);
        if let Some(status) = status {
            submission.status = status;
        }
        Ok(())
    }

    fn review(&self, id: SubmissionId, status: SubmissionStatus) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NotTerminal(status));
        }

        let mut submission = self
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::UnknownSubmission(id))?;
        if submission.status.is_terminal() {
            return Err(StoreError::NotPending(id, submission.status));
        }
        if !self.results.contains_key(&id) {
            return Err(StoreError::NoResult(id));
        }

        submission.status = status;
        Ok(())
    }
}
