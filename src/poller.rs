//! Adaptive status polling for a submitted job.
//!
//! The poller waits an initial delay, then asks the provider for status until
//! the job reaches a terminal condition, the wall-clock budget runs out, or the
//! caller cancels. Transport failures back off exponentially with jitter; a
//! success status whose artifact does not decode yet is re-polled on a short
//! fixed delay.

use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::decoder::{Artifact, DecodeError, ResultDecoder};
use crate::provider::{JobHandle, JobProvider, ProviderStatus, StatusLexicon};
use crate::state_machine::{FailureReason, GenerationJob, JobState, StateMachine};

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait before the first status request.
    pub initial_delay: Duration,
    /// Interval while the job is running.
    pub base_interval: Duration,
    /// Interval while the job is queued (never shorter than `base_interval`).
    pub queued_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    /// Upper bound of the uniform jitter added to each backoff.
    pub jitter_max: Duration,
    /// Consecutive transport errors tolerated; one more gives up.
    pub max_transport_errors: u32,
    pub artifact_retry_delay: Duration,
    pub artifact_retry_cap: u32,
    /// Wall-clock budget. `None` uses the capability default.
    pub budget: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            base_interval: Duration::from_secs(4),
            queued_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            backoff_max: Duration::from_secs(30),
            jitter_max: Duration::from_secs(2),
            max_transport_errors: 5,
            artifact_retry_delay: Duration::from_millis(2500),
            artifact_retry_cap: 5,
            budget: None,
        }
    }
}

impl PollConfig {
    /// Backoff after `errors` consecutive failures, without jitter.
    ///
    /// `min(backoff_base * backoff_multiplier^errors, backoff_max)`; non-decreasing
    /// in `errors` for any multiplier ≥ 1.
    pub fn backoff_delay(&self, errors: u32) -> Duration {
        let exponent = i32::try_from(errors).unwrap_or(i32::MAX);
        let secs = self.backoff_base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.backoff_max.as_secs_f64() {
            return self.backoff_max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Backoff plus uniform jitter in `[0, jitter_max]`.
    pub fn jittered_backoff(&self, errors: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff_delay(errors) + jitter
    }

    fn queued_wait(&self) -> Duration {
        self.base_interval.max(self.queued_interval)
    }

    pub fn budget_for(&self, job: &GenerationJob) -> Duration {
        self.budget
            .unwrap_or_else(|| job.capability.default_poll_budget())
    }
}

/// How polling ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Provider reported success and the artifact decoded.
    Succeeded(Artifact),
    /// Provider reported a terminal failure. The job is `Failed`.
    Failed(String),
    /// Gave up on transport errors or a never-attached artifact. The job is `Failed`.
    Exhausted(FailureReason),
    /// Success kept carrying a payload that does not decode. The job is `Failed`.
    NoArtifact(DecodeError),
    /// Budget ran out. The job is `TimedOut`.
    TimedOut,
    /// The caller cancelled. The job state is untouched.
    Cancelled,
}

pub struct StatusPoller<'a, P> {
    provider: &'a P,
    config: &'a PollConfig,
    lexicon: &'a StatusLexicon,
    decoder: &'a ResultDecoder,
}

impl<'a, P: JobProvider> StatusPoller<'a, P> {
    pub fn new(
        provider: &'a P,
        config: &'a PollConfig,
        lexicon: &'a StatusLexicon,
        decoder: &'a ResultDecoder,
    ) -> Self {
        Self {
            provider,
            config,
            lexicon,
            decoder,
        }
    }

    pub async fn poll_until_terminal(
        &self,
        job: &mut GenerationJob,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + self.config.budget_for(job);
        let media = job.capability.media_kind();
        let mut wait = self.config.initial_delay;
        let mut artifact_retries = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                let elapsed = now.duration_since(started).as_secs();
                StateMachine::time_out(job, elapsed);
                tracing::warn!(
                    job_id = %job.job_id,
                    actor = %job.actor_id,
                    elapsed_secs = elapsed,
                    polls = job.poll_attempt,
                    "Polling budget exhausted"
                );
                return PollOutcome::TimedOut;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(job),
                _ = sleep(wait.min(deadline - now)) => {}
            }

            job.record_poll();
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(job),
                status = self.provider.status(handle) => status,
            };
            let report = match status {
                Ok(report) => report,
                Err(e) => {
                    let errors = job.record_transport_error();
                    if errors > self.config.max_transport_errors {
                        let reason = FailureReason::PollingExhausted {
                            consecutive_errors: errors,
                        };
                        tracing::error!(
                            job_id = %job.job_id,
                            actor = %job.actor_id,
                            errors,
                            error = %e,
                            "Giving up after consecutive transport errors"
                        );
                        StateMachine::fail(job, reason.clone());
                        return PollOutcome::Exhausted(reason);
                    }
                    wait = self.config.jittered_backoff(errors);
                    tracing::warn!(
                        job_id = %job.job_id,
                        actor = %job.actor_id,
                        errors,
                        retry_in_ms = wait.as_millis() as u64,
                        error = %e,
                        "Status poll failed"
                    );
                    continue;
                }
            };
            job.reset_transport_errors();

            match self.lexicon.classify(&report.status) {
                ProviderStatus::Succeeded => {
                    let decoded = report
                        .result
                        .as_ref()
                        .map(|payload| self.decoder.decode(payload, media));
                    match decoded {
                        Some(Ok(artifact)) => {
                            tracing::info!(
                                job_id = %job.job_id,
                                actor = %job.actor_id,
                                polls = job.poll_attempt,
                                "Provider reported success"
                            );
                            return PollOutcome::Succeeded(artifact);
                        }
                        Some(Err(e)) if artifact_retries >= self.config.artifact_retry_cap => {
                            tracing::error!(
                                job_id = %job.job_id,
                                actor = %job.actor_id,
                                attempts = artifact_retries,
                                error = %e,
                                "Success reported but payload never decoded"
                            );
                            StateMachine::fail(job, FailureReason::NoArtifactFound);
                            return PollOutcome::NoArtifact(e);
                        }
                        None if artifact_retries >= self.config.artifact_retry_cap => {
                            let reason = FailureReason::ArtifactNeverAttached {
                                attempts: artifact_retries,
                            };
                            tracing::error!(
                                job_id = %job.job_id,
                                actor = %job.actor_id,
                                attempts = artifact_retries,
                                "Success reported but artifact never attached"
                            );
                            StateMachine::fail(job, reason.clone());
                            return PollOutcome::Exhausted(reason);
                        }
                        _ => {
                            artifact_retries += 1;
                            wait = self.config.artifact_retry_delay;
                            tracing::debug!(
                                job_id = %job.job_id,
                                attempt = artifact_retries,
                                "Success without artifact, re-polling"
                            );
                        }
                    }
                }
                ProviderStatus::Failed => {
                    let message = report
                        .error
                        .unwrap_or_else(|| format!("provider reported {}", report.status));
                    tracing::warn!(
                        job_id = %job.job_id,
                        actor = %job.actor_id,
                        error = %message,
                        "Provider reported failure"
                    );
                    StateMachine::fail(job, FailureReason::ProviderFailed(message.clone()));
                    return PollOutcome::Failed(message);
                }
                ProviderStatus::Queued => {
                    StateMachine::observe(job, JobState::Queued);
                    artifact_retries = 0;
                    wait = self.config.queued_wait();
                }
                ProviderStatus::InProgress => {
                    StateMachine::observe(job, JobState::InProgress);
                    artifact_retries = 0;
                    wait = self.config.base_interval;
                }
            }
        }
    }
}

fn cancelled(job: &GenerationJob) -> PollOutcome {
    tracing::info!(
        job_id = %job.job_id,
        actor = %job.actor_id,
        state = %job.state,
        "Polling cancelled"
    );
    PollOutcome::Cancelled
}
