pub mod compare;
pub mod config;
pub mod import_contest;
pub mod judge;
pub mod language;
pub mod models;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod scoreboard;
pub mod store;

pub use config::Config;
pub use judge::{Judge, JudgeError, Verdict, VerdictEvent};
pub use queue::WorkerPool;
pub use runner::{Judgement, SubmissionRunner};
pub use scoreboard::{rank, Scoreboard};
pub use store::{MemoryStore, SubmissionStore};
