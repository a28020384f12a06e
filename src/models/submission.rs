use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a submission, allocated before any judging work starts so the
/// working directory key never depends on the storage layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        SubmissionId(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_simple())
    }
}

impl FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SubmissionId(Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Passed,
    Failed,
    RunFailure,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        self != SubmissionStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Passed => "passed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::RunFailure => "run_failure",
        }
    }
}

impl Default for SubmissionStatus {
    fn default() -> Self {
        SubmissionStatus::Pending
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub id: SubmissionId,
    pub team_id: i32,
    pub problem_id: i32,
    pub language: String,
    pub source_path: PathBuf,
    pub submission_instant: NaiveDateTime,
    #[serde(default)]
    pub status: SubmissionStatus,
    #[serde(default)]
    pub runtime_ms: Option<u64>,
}

pub struct NewSubmission {
    pub team_id: i32,
    pub problem_id: i32,
    pub language: String,
    pub source_path: PathBuf,
    pub submission_instant: NaiveDateTime,
}

impl Submission {
    pub fn new(new_submission: NewSubmission) -> Submission {
        let NewSubmission {
            team_id,
            problem_id,
            language,
            source_path,
            submission_instant,
        } = new_submission;

        Submission {
            id: SubmissionId::new(),
            team_id,
            problem_id,
            language,
            source_path,
            submission_instant,
            status: SubmissionStatus::Pending,
            runtime_ms: None,
        }
    }
}

/// Evidence captured from the single execution attempt of a submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: SubmissionId,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
}

/// The one write the judging pipeline performs on a submission.
///
/// `status` is `None` when the run succeeded on a problem that is not judged
/// automatically: the result is kept and the status stays pending until
/// reviewed.
#[derive(Clone, Debug)]
pub struct SubmissionCompletion {
    pub id: SubmissionId,
    pub status: Option<SubmissionStatus>,
    pub runtime_ms: u64,
    pub result: SubmissionResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names() {
        assert_eq!(SubmissionStatus::RunFailure.to_string(), "run_failure");
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::RunFailure).unwrap(),
            "\"run_failure\""
        );
        assert!(!SubmissionStatus::Pending.is_terminal());
        assert!(SubmissionStatus::Failed.is_terminal());
    }

    #[test]
    fn ids_parse_back() {
        let id = SubmissionId::new();
        assert_eq!(id.to_string().parse::<SubmissionId>().unwrap(), id);
        assert_ne!(SubmissionId::new(), id);
    }
}
