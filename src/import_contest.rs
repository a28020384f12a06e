use log::info;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{Contest, Problem, Submission, Team};
use crate::store::MemoryStore;

mod error {
    use std::io;
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum ImportContestError {
        #[error("couldn't read {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error(transparent)]
        JsonDecode(#[from] serde_json::Error),
        #[error("{kind} {id} belongs to contest {found}, not {expected}")]
        WrongContest {
            kind: &'static str,
            id: i32,
            found: i32,
            expected: i32,
        },
        #[error("submission refers to unknown {kind} {id}")]
        UnknownReference { kind: &'static str, id: i32 },
    }
}

pub use error::ImportContestError;

pub const MANIFEST_NAME: &str = "contest.json";

/// Layout of `contest.json`. Paths are relative to the contest directory.
#[derive(Deserialize, Debug)]
struct Manifest {
    contest: Contest,
    #[serde(default)]
    problems: Vec<Problem>,
    #[serde(default)]
    teams: Vec<Team>,
    #[serde(default)]
    submissions: Vec<Submission>,
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// Loads a contest directory into a fresh [`MemoryStore`], returning the
/// store and the contest id.
pub fn import_contest(contest_dir: &Path) -> Result<(MemoryStore, i32), ImportContestError> {
    let manifest_path = contest_dir.join(MANIFEST_NAME);
    let manifest = fs::read_to_string(&manifest_path).map_err(|source| ImportContestError::Io {
        path: manifest_path,
        source,
    })?;
    let Manifest {
        contest,
        mut problems,
        teams,
        mut submissions,
    } = serde_json::from_str(&manifest)?;

    for problem in &mut problems {
        if problem.contest_id != contest.id {
            return Err(ImportContestError::WrongContest {
                kind: "problem",
                id: problem.id,
                found: problem.contest_id,
                expected: contest.id,
            });
        }
        resolve(contest_dir, &mut problem.output_path);
        if let Some(input_path) = &mut problem.input_path {
            resolve(contest_dir, input_path);
        }
    }
    for team in &teams {
        if team.contest_id != contest.id {
            return Err(ImportContestError::WrongContest {
                kind: "team",
                id: team.id,
                found: team.contest_id,
                expected: contest.id,
            });
        }
    }
    for submission in &mut submissions {
        if !problems.iter().any(|problem| problem.id == submission.problem_id) {
            return Err(ImportContestError::UnknownReference {
                kind: "problem",
                id: submission.problem_id,
            });
        }
        if !teams.iter().any(|team| team.id == submission.team_id) {
            return Err(ImportContestError::UnknownReference {
                kind: "team",
                id: submission.team_id,
            });
        }
        resolve(contest_dir, &mut submission.source_path);
    }

    info!(
        "Imported contest {:?}: {} problems, {} teams, {} submissions",
        contest.name,
        problems.len(),
        teams.len(),
        submissions.len()
    );

    let contest_id = contest.id;
    let store = MemoryStore::new();
    store.insert_contest(contest);
    problems.into_iter().for_each(|problem| store.insert_problem(problem));
    teams.into_iter().for_each(|team| store.insert_team(team));
    for submission in submissions {
        store.insert_submission(submission);
    }
    Ok((store, contest_id))
}
