//! Contest ranking, recomputed from submissions on every call.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;

use crate::models::{Contest, Problem, Submission, SubmissionStatus, Team};
use crate::store::{StoreError, SubmissionStore};

pub const DEFAULT_PENALTY_MINUTES: i64 = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProblemColumn {
    /// 1-based position, used as the column header.
    pub number: usize,
    pub problem_id: i32,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProblemScore {
    /// Judged submissions up to and including the first pass.
    pub attempts: u32,
    pub solved: bool,
    pub solve_time: Option<NaiveDateTime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Standing {
    pub position: usize,
    pub team: Team,
    pub solved_count: u32,
    /// Minutes: solve offsets plus the penalty for rejected attempts.
    pub time_penalty: i64,
    pub last_solve: Option<NaiveDateTime>,
    /// One per column, same order.
    pub problems: Vec<ProblemScore>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Scoreboard {
    pub problems: Vec<ProblemColumn>,
    pub standings: Vec<Standing>,
}

fn score_problem(mut submissions: Vec<&Submission>) -> ProblemScore {
    submissions.sort_by_key(|submission| (submission.submission_instant, submission.id));

    let mut score = ProblemScore::default();
    for submission in submissions {
        score.attempts += 1;
        if submission.status == SubmissionStatus::Passed {
            score.solved = true;
            score.solve_time = Some(submission.submission_instant);
            break;
        }
    }
    score
}

/// Ranks the teams of `contest`.
///
/// Pending submissions are ignored. Teams are ordered by solved problems
/// (more first), then time penalty, then the instant of their last solve,
/// then id.
pub fn rank(
    contest: &Contest,
    problems: &[Problem],
    teams: &[Team],
    submissions: &[Submission],
    penalty_minutes: i64,
) -> Scoreboard {
    let mut problems: Vec<&Problem> = problems
        .iter()
        .filter(|problem| problem.contest_id == contest.id)
        .collect();
    problems.sort_by_key(|problem| problem.id);

    let mut judged: HashMap<(i32, i32), Vec<&Submission>> = HashMap::new();
    for submission in submissions {
        if submission.status.is_terminal() {
            judged
                .entry((submission.team_id, submission.problem_id))
                .or_default()
                .push(submission);
        }
    }

    let mut standings: Vec<Standing> = teams
        .iter()
        .filter(|team| team.contest_id == contest.id)
        .map(|team| {
            let scores: Vec<ProblemScore> = problems
                .iter()
                .map(|problem| {
                    score_problem(
                        judged
                            .remove(&(team.id, problem.id))
                            .unwrap_or_default(),
                    )
                })
                .collect();

            let mut standing = Standing {
                position: 0,
                team: team.clone(),
                solved_count: 0,
                time_penalty: 0,
                last_solve: None,
                problems: vec![],
            };
            for score in &scores {
                if let Some(solve_time) = score.solve_time {
                    standing.solved_count += 1;
                    standing.time_penalty += contest.minutes_since_start(solve_time)
                        + penalty_minutes * i64::from(score.attempts - 1);
                    standing.last_solve = standing.last_solve.max(Some(solve_time));
                }
            }
            standing.problems = scores;
            standing
        })
        .collect();

    standings.sort_by_key(|standing| {
        (
            Reverse(standing.solved_count),
            standing.time_penalty,
            standing.last_solve,
            standing.team.id,
        )
    });
    for (index, standing) in standings.iter_mut().enumerate() {
        standing.position = index + 1;
    }

    Scoreboard {
        problems: problems
            .iter()
            .enumerate()
            .map(|(index, problem)| ProblemColumn {
                number: index + 1,
                problem_id: problem.id,
                label: problem.label.clone(),
            })
            .collect(),
        standings,
    }
}

/// Loads a contest from `store` and ranks it.
pub fn rank_contest<S: SubmissionStore + ?Sized>(
    store: &S,
    contest_id: i32,
    penalty_minutes: i64,
) -> Result<Scoreboard, StoreError> {
    let contest = store.contest(contest_id)?;
    Ok(rank(
        &contest,
        &store.problems(contest_id)?,
        &store.teams(contest_id)?,
        &store.submissions(contest_id)?,
        penalty_minutes,
    ))
}

impl Scoreboard {
    pub fn standing(&self, team_id: i32) -> Option<&Standing> {
        self.standings
            .iter()
            .find(|standing| standing.team.id == team_id)
    }

    fn rows(&self) -> Vec<Vec<String>> {
        let mut header = vec!["#".to_string(), "Team".to_string()];
        header.extend(self.problems.iter().map(|column| column.number.to_string()));
        header.push("Score".into());
        header.push("Time + Penalty".into());

        let mut rows = vec![header];
        for standing in &self.standings {
            let mut row = vec![standing.position.to_string(), standing.team.name.clone()];
            row.extend(standing.problems.iter().map(|score| match score {
                ProblemScore {
                    attempts,
                    solved: true,
                    ..
                } => format!("{}*", attempts),
                ProblemScore { attempts, .. } => attempts.to_string(),
            }));
            row.push(standing.solved_count.to_string());
            row.push(standing.time_penalty.to_string());
            rows.push(row);
        }
        rows
    }
}

/// Plain-text table. Problem cells show attempts, `*` marks a solve.
impl fmt::Display for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let mut widths = vec![0; rows[0].len()];
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        for row in &rows {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = width))
                .collect();
            writeln!(f, "{}", line.join("  ").trim_end())?;
        }
        Ok(())
    }
}
