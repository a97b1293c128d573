use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{FailureReason, GenerationJob};

/// Lifecycle states of a provider-side generation job.
///
/// Each job flows through: SUBMITTED → {QUEUED, IN_PROGRESS} → {COMPLETED, FAILED},
/// with TIMED_OUT imposed by the poller when the wall-clock budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Queued,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Queued => write!(f, "QUEUED"),
            JobState::InProgress => write!(f, "IN_PROGRESS"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// The result of asking the state machine to move a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job moved to a new state.
    Advanced(JobState),
    /// The observed state equals the current one (e.g. still queued).
    Unchanged,
    /// The move is not allowed; the job keeps its current state.
    Rejected { from: JobState, to: JobState },
}

/// Drives a [`GenerationJob`] through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Record an observed non-terminal state (queued / in progress).
    ///
    /// - Terminal jobs reject every move.
    /// - Nothing may move back to `Submitted`.
    /// - Terminal targets must go through [`StateMachine::complete`],
    ///   [`StateMachine::fail`] or [`StateMachine::time_out`] so that their
    ///   payload (`result` / `error`) is always set together with the state.
    pub fn observe(job: &mut GenerationJob, observed: JobState) -> Transition {
        if job.state.is_terminal() || observed.is_terminal() || observed == JobState::Submitted {
            return Transition::Rejected {
                from: job.state,
                to: observed,
            };
        }
        if job.state == observed {
            return Transition::Unchanged;
        }
        Self::enter(job, observed);
        Transition::Advanced(observed)
    }

    /// Move the job to `Completed` with its decoded artifact URLs.
    pub fn complete(job: &mut GenerationJob, urls: Vec<String>) -> Transition {
        if job.state.is_terminal() {
            return Transition::Rejected {
                from: job.state,
                to: JobState::Completed,
            };
        }
        Self::enter(job, JobState::Completed);
        job.result = Some(urls);
        Transition::Advanced(JobState::Completed)
    }

    /// Move the job to `Failed` carrying the classified reason.
    pub fn fail(job: &mut GenerationJob, reason: FailureReason) -> Transition {
        if job.state.is_terminal() {
            return Transition::Rejected {
                from: job.state,
                to: JobState::Failed,
            };
        }
        Self::enter(job, JobState::Failed);
        job.error = Some(reason);
        Transition::Advanced(JobState::Failed)
    }

    /// Move the job to `TimedOut` after the wall-clock budget is spent.
    pub fn time_out(job: &mut GenerationJob, elapsed_secs: u64) -> Transition {
        if job.state.is_terminal() {
            return Transition::Rejected {
                from: job.state,
                to: JobState::TimedOut,
            };
        }
        Self::enter(job, JobState::TimedOut);
        job.error = Some(FailureReason::TimedOut { elapsed_secs });
        Transition::Advanced(JobState::TimedOut)
    }

    fn enter(job: &mut GenerationJob, next: JobState) {
        job.state_history.push(job.state);
        job.state = next;
        if next.is_terminal() {
            job.terminal_at = Some(chrono::Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Capability;
    use rust_decimal_macros::dec;

    fn make_job() -> GenerationJob {
        GenerationJob::new("req-1".into(), "alice".into(), Capability::Video, dec!(3))
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job();
        assert_eq!(job.state, JobState::Submitted);

        let t = StateMachine::observe(&mut job, JobState::Queued);
        assert_eq!(t, Transition::Advanced(JobState::Queued));

        let t = StateMachine::observe(&mut job, JobState::InProgress);
        assert_eq!(t, Transition::Advanced(JobState::InProgress));

        let t = StateMachine::observe(&mut job, JobState::InProgress);
        assert_eq!(t, Transition::Unchanged);

        let t = StateMachine::complete(&mut job, vec!["https://cdn.example/a.mp4".into()]);
        assert_eq!(t, Transition::Advanced(JobState::Completed));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.terminal_at.is_some());
        assert_eq!(
            job.state_history,
            vec![JobState::Submitted, JobState::Queued, JobState::InProgress]
        );
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut job = make_job();
        StateMachine::fail(&mut job, FailureReason::ProviderFailed("nsfw".into()));
        assert_eq!(job.state, JobState::Failed);

        assert!(matches!(
            StateMachine::observe(&mut job, JobState::InProgress),
            Transition::Rejected { .. }
        ));
        assert!(matches!(
            StateMachine::complete(&mut job, vec![]),
            Transition::Rejected { .. }
        ));
        assert!(matches!(
            StateMachine::time_out(&mut job, 600),
            Transition::Rejected { .. }
        ));
        assert_eq!(job.state, JobState::Failed);
        assert!(job.result.is_none());
    }

    #[test]
    fn observe_rejects_terminal_targets_and_submitted() {
        let mut job = make_job();
        StateMachine::observe(&mut job, JobState::InProgress);

        let t = StateMachine::observe(&mut job, JobState::Completed);
        assert!(matches!(t, Transition::Rejected { .. }));
        let t = StateMachine::observe(&mut job, JobState::Submitted);
        assert!(matches!(t, Transition::Rejected { .. }));
        assert_eq!(job.state, JobState::InProgress);
    }

    #[test]
    fn time_out_records_reason() {
        let mut job = make_job();
        StateMachine::time_out(&mut job, 900);
        assert_eq!(job.state, JobState::TimedOut);
        assert_eq!(job.error, Some(FailureReason::TimedOut { elapsed_secs: 900 }));
    }

    #[test]
    fn state_display() {
        assert_eq!(JobState::Submitted.to_string(), "SUBMITTED");
        assert_eq!(JobState::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(JobState::TimedOut.to_string(), "TIMED_OUT");
    }
}
