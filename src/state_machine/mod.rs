mod job;
mod state;

pub use job::{FailureReason, GenerationJob, JobSummary};
pub use state::{JobState, StateMachine, Transition};
