pub mod contest;
pub mod problem;
pub mod submission;
pub mod team;

pub use contest::Contest;
pub use problem::Problem;
pub use submission::{
    NewSubmission, Submission, SubmissionCompletion, SubmissionId, SubmissionResult,
    SubmissionStatus,
};
pub use team::Team;
