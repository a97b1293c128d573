use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::JobState;
use crate::pricing::Capability;

/// Why a job ended without an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The provider reported a terminal failure status.
    ProviderFailed(String),
    /// Too many consecutive transport/parse errors while polling.
    PollingExhausted { consecutive_errors: u32 },
    /// Success was reported but the artifact never got attached.
    ArtifactNeverAttached { attempts: u32 },
    /// Success was reported but no usable URL could be decoded.
    NoArtifactFound,
    /// The wall-clock budget ran out while the job was still running.
    TimedOut { elapsed_secs: u64 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ProviderFailed(msg) => write!(f, "Provider failure: {msg}"),
            FailureReason::PollingExhausted { consecutive_errors } => {
                write!(f, "Polling exhausted after {consecutive_errors} transport errors")
            }
            FailureReason::ArtifactNeverAttached { attempts } => {
                write!(f, "Artifact missing after {attempts} completion re-polls")
            }
            FailureReason::NoArtifactFound => write!(f, "No artifact found in result"),
            FailureReason::TimedOut { elapsed_secs } => {
                write!(f, "Timed out after {elapsed_secs}s")
            }
        }
    }
}

/// One provider-side unit of generation work, tracked from submission to settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub actor_id: String,
    pub capability: Capability,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub poll_attempt: u32,
    pub consecutive_transport_errors: u32,
    pub credits_reserved: Decimal,
    pub credits_settled: Option<Decimal>,
    pub result: Option<Vec<String>>,
    pub error: Option<FailureReason>,
}

impl GenerationJob {
    pub fn new(
        job_id: String,
        actor_id: String,
        capability: Capability,
        credits_reserved: Decimal,
    ) -> Self {
        Self {
            job_id,
            actor_id,
            capability,
            state: JobState::Submitted,
            state_history: Vec::new(),
            submitted_at: Utc::now(),
            last_polled_at: None,
            terminal_at: None,
            poll_attempt: 0,
            consecutive_transport_errors: 0,
            credits_reserved,
            credits_settled: None,
            result: None,
            error: None,
        }
    }

    /// Count a poll attempt and stamp its time.
    pub fn record_poll(&mut self) {
        self.poll_attempt += 1;
        self.last_polled_at = Some(Utc::now());
    }

    /// Count a failed poll and return the new consecutive error count.
    pub fn record_transport_error(&mut self) -> u32 {
        self.consecutive_transport_errors += 1;
        self.consecutive_transport_errors
    }

    pub fn reset_transport_errors(&mut self) {
        self.consecutive_transport_errors = 0;
    }

    /// Record the settled amount. Returns `false` (and changes nothing) if the
    /// job was already settled.
    pub fn record_settlement(&mut self, amount: Decimal) -> bool {
        if self.credits_settled.is_some() {
            return false;
        }
        self.credits_settled = Some(amount);
        true
    }
}

/// Structured summary produced when a job reaches a terminal state or goes pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub actor_id: String,
    pub capability: Capability,
    pub state: JobState,
    pub state_transitions: Vec<JobState>,
    pub poll_attempts: u32,
    pub credits_reserved: Decimal,
    pub credits_settled: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobSummary {
    pub fn from_job(job: &GenerationJob) -> Self {
        let end = job.terminal_at.unwrap_or_else(Utc::now);
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            job_id: job.job_id.clone(),
            actor_id: job.actor_id.clone(),
            capability: job.capability,
            state: job.state,
            state_transitions: transitions,
            poll_attempts: job.poll_attempt,
            credits_reserved: job.credits_reserved,
            credits_settled: job.credits_settled,
            submitted_at: job.submitted_at,
            duration_ms: (end - job.submitted_at).num_milliseconds(),
        }
    }
}
