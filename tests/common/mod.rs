#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use konkurso::compare::WhitespaceRule;
use konkurso::language::get_supported_languages;
use konkurso::models::{Contest, NewSubmission, Problem, Submission, SubmissionId, Team};
use konkurso::sandbox::ProcessSandbox;
use konkurso::{Config, Judge, MemoryStore, SubmissionRunner};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn python_available() -> bool {
    which::which("python3").is_ok()
}

pub fn java_available() -> bool {
    which::which("javac").is_ok() && which::which("java").is_ok()
}

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd(2021, 9, 18).and_hms(h, m, 0)
}

/// A one-problem contest judged locally in the process sandbox.
pub struct OneProblemContest {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub judge: Arc<Judge<MemoryStore>>,
}

pub struct ProblemSetup<'a> {
    pub input: Option<&'a str>,
    pub output: &'a [u8],
    pub timeout: Option<u32>,
    pub whitespace_rule: WhitespaceRule,
    pub auto_judge: bool,
}

impl Default for ProblemSetup<'_> {
    fn default() -> Self {
        ProblemSetup {
            input: Some("3\n"),
            output: b"6\n",
            timeout: None,
            whitespace_rule: WhitespaceRule::PlainDiff,
            auto_judge: true,
        }
    }
}

impl OneProblemContest {
    pub fn new(setup: ProblemSetup) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output"), setup.output).unwrap();
        if let Some(input) = setup.input {
            fs::write(dir.path().join("input"), input).unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        store.insert_contest(Contest {
            id: 1,
            name: "Maratona".into(),
            start_instant: Some(at(13, 0)),
            end_instant: Some(at(18, 0)),
        });
        store.insert_problem(Problem {
            id: 1,
            contest_id: 1,
            label: "A".into(),
            name: "Double".into(),
            output_path: dir.path().join("output"),
            input_path: setup.input.map(|_| dir.path().join("input")),
            timeout: setup.timeout,
            whitespace_rule: setup.whitespace_rule,
            ignore_case: false,
            auto_judge: setup.auto_judge,
            has_input: setup.input.is_some(),
        });
        for id in 1..=2 {
            store.insert_team(Team {
                id,
                contest_id: 1,
                name: format!("Team {}", id),
            });
        }

        let config = Config {
            work_dir: dir.path().join("work"),
            default_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let runner = SubmissionRunner::new(
            Arc::new(ProcessSandbox::new()),
            get_supported_languages(),
            &config,
        );
        let judge = Arc::new(Judge::new(store.clone(), runner));

        OneProblemContest { dir, store, judge }
    }

    pub fn submit(&self, team_id: i32, source: &str, submission_instant: NaiveDateTime) -> SubmissionId {
        self.submit_as(team_id, "python.3", source, submission_instant)
    }

    pub fn submit_as(
        &self,
        team_id: i32,
        language: &str,
        source: &str,
        submission_instant: NaiveDateTime,
    ) -> SubmissionId {
        let id = SubmissionId::new();
        let source_path: PathBuf = self.dir.path().join(format!("{}.src", id));
        fs::write(&source_path, source).unwrap();

        let mut submission = Submission::new(NewSubmission {
            team_id,
            problem_id: 1,
            language: language.into(),
            source_path,
            submission_instant,
        });
        submission.id = id;
        self.store.insert_submission(submission)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }
}

pub const DOUBLES: &str = "print(int(input()) * 2)\n";
