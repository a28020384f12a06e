use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::compare::{ComparePolicy, WhitespaceRule};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Problem {
    pub id: i32,
    pub contest_id: i32,
    pub label: String,
    pub name: String,
    pub output_path: PathBuf,
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    /// Wall-clock limit for a single run, in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub whitespace_rule: WhitespaceRule,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default = "default_auto_judge")]
    pub auto_judge: bool,
    #[serde(default)]
    pub has_input: bool,
}

fn default_auto_judge() -> bool {
    true
}

impl Problem {
    pub fn compare_policy(&self) -> ComparePolicy {
        ComparePolicy {
            whitespace: self.whitespace_rule,
            ignore_case: self.ignore_case,
        }
    }

    pub fn time_limit(&self, default: Duration) -> Duration {
        match self.timeout {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds.into()),
            _ => default,
        }
    }

    /// Input fed to the program, if the problem reads one.
    pub fn stdin_path(&self) -> Option<&PathBuf> {
        if self.has_input {
            self.input_path.as_ref()
        } else {
            None
        }
    }
}
