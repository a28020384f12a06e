use chrono::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contest {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub start_instant: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_instant: Option<NaiveDateTime>,
}

impl Contest {
    /// Whole minutes elapsed between the contest start and `instant`.
    ///
    /// Instants before the start, or a contest without a start instant, count
    /// as minute zero.
    pub fn minutes_since_start(&self, instant: NaiveDateTime) -> i64 {
        match self.start_instant {
            Some(start) => (instant - start).num_minutes().max(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd(2021, 9, 18).and_hms(h, m, s)
    }

    #[test]
    fn minutes_are_truncated() {
        let contest = Contest {
            id: 1,
            name: "Warmup".into(),
            start_instant: Some(at(13, 0, 0)),
            end_instant: None,
        };
        assert_eq!(contest.minutes_since_start(at(13, 41, 59)), 41);
        assert_eq!(contest.minutes_since_start(at(12, 59, 0)), 0);
    }

    #[test]
    fn contest_without_start_counts_from_zero() {
        let contest = Contest {
            id: 1,
            name: "Warmup".into(),
            start_instant: None,
            end_instant: None,
        };
        assert_eq!(contest.minutes_since_start(at(18, 0, 0)), 0);
    }
}
