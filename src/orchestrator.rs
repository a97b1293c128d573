use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::decoder::{Artifact, ResultDecoder};
use crate::discount::{DiscountCache, DiscountOracle, NoDiscounts};
use crate::error::RelayError;
use crate::ledger::{CreditLedger, LedgerError, Reservation, SettleOutcome, Settlement};
use crate::poller::{PollConfig, PollOutcome, StatusPoller};
use crate::pricing::{Capability, PriceTable};
use crate::provider::{
    JobHandle, JobProvider, ProviderRequest, ProviderStatus, StatusLexicon,
};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::state_machine::{FailureReason, GenerationJob, JobSummary, StateMachine, Transition};
use crate::submitter::JobSubmitter;

/// Why a job was left without settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReason {
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for PendingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingReason::TimedOut => write!(f, "timed out"),
            PendingReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Caller-facing result of a job that did not error.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        job_id: String,
        artifact: Artifact,
        credits_deducted: Decimal,
        /// Credits the actor can still spend (balance minus other open holds).
        remaining_credits: Decimal,
        summary: JobSummary,
    },
    /// Still running at the provider; the reservation is held until reconciled.
    Pending {
        job_id: String,
        reason: PendingReason,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Completed { job_id, .. } | JobOutcome::Pending { job_id, .. } => job_id,
        }
    }
}

// A job whose reservation is still open after polling stopped.
struct PendingJob {
    reservation: Reservation,
    job: GenerationJob,
    handle: JobHandle,
    reason: PendingReason,
    // Reconciliations that saw success without a decodable artifact.
    artifact_checks: u32,
}

struct Discounts<D> {
    oracle: D,
    cache: Arc<DiscountCache>,
}

/// Drives paid jobs from admission to settlement.
///
/// Every reservation the orchestrator opens is settled exactly once: success
/// spends it, any failure after the reservation refunds it, and a timeout or
/// cancellation parks it in the pending registry until [`reconcile`](Self::reconcile).
pub struct JobOrchestrator<P, L, D = NoDiscounts> {
    provider: P,
    ledger: L,
    discounts: Option<Discounts<D>>,
    rate_limiter: RateLimiter,
    prices: PriceTable,
    submitter: JobSubmitter,
    poll: PollConfig,
    lexicon: StatusLexicon,
    decoder: ResultDecoder,
    pending: Mutex<HashMap<String, PendingJob>>,
}

impl<P: JobProvider, L: CreditLedger> JobOrchestrator<P, L, NoDiscounts> {
    pub fn new(provider: P, ledger: L) -> Self {
        Self {
            provider,
            ledger,
            discounts: None,
            rate_limiter: RateLimiter::default(),
            prices: PriceTable::default(),
            submitter: JobSubmitter::default(),
            poll: PollConfig::default(),
            lexicon: StatusLexicon::default(),
            decoder: ResultDecoder::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator with every component tuned from `config`.
    pub fn from_config(provider: P, ledger: L, config: &RelayConfig) -> Self {
        Self::new(provider, ledger)
            .with_rate_limiter(RateLimiter::new(config.rate_limit.to_config()))
            .with_prices(config.price_table())
            .with_submitter(JobSubmitter::new(config.submit.to_config()))
            .with_poll_config(config.poll.to_config())
            .with_lexicon(config.lexicon.clone())
    }
}

impl<P: JobProvider, L: CreditLedger, D: DiscountOracle> JobOrchestrator<P, L, D> {
    /// Price jobs through `oracle`, memoized by `cache`.
    pub fn with_discounts<D2: DiscountOracle>(
        self,
        oracle: D2,
        cache: Arc<DiscountCache>,
    ) -> JobOrchestrator<P, L, D2> {
        JobOrchestrator {
            provider: self.provider,
            ledger: self.ledger,
            discounts: Some(Discounts { oracle, cache }),
            rate_limiter: self.rate_limiter,
            prices: self.prices,
            submitter: self.submitter,
            poll: self.poll,
            lexicon: self.lexicon,
            decoder: self.decoder,
            pending: self.pending,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_submitter(mut self, submitter: JobSubmitter) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_lexicon(mut self, lexicon: StatusLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn with_decoder(mut self, decoder: ResultDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn discount_cache(&self) -> Option<Arc<DiscountCache>> {
        self.discounts.as_ref().map(|d| Arc::clone(&d.cache))
    }

    /// Submit a job and wait for its artifact, without external cancellation.
    pub async fn submit_and_await(
        &self,
        actor_id: &str,
        capability: Capability,
        endpoint: &str,
        params: Value,
    ) -> Result<JobOutcome, RelayError> {
        let request = ProviderRequest {
            capability,
            endpoint: endpoint.to_string(),
            params,
        };
        self.run(actor_id, request, &CancellationToken::new()).await
    }

    /// Price of `capability` for `actor_id` after any discount.
    ///
    /// A discount lookup that keeps failing prices the job at full rate.
    pub async fn quote(
        &self,
        actor_id: &str,
        capability: Capability,
        params: &Value,
    ) -> Result<Decimal, RelayError> {
        let price = self.prices.resolve(capability, params)?;
        let Some(discounts) = &self.discounts else {
            return Ok(price);
        };

        let lookup = discounts
            .cache
            .get_or_compute(actor_id, capability, || {
                discounts.oracle.lookup(actor_id, capability)
            })
            .await;
        match lookup {
            Ok(discount) => Ok(discount.apply(price)),
            Err(message) => {
                tracing::warn!(
                    actor = actor_id,
                    %capability,
                    error = %message,
                    "Discount unavailable, charging full price"
                );
                Ok(price)
            }
        }
    }

    /// Run one job end to end.
    pub async fn run(
        &self,
        actor_id: &str,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, RelayError> {
        if let RateLimitResult::Limited { retry_after } =
            self.rate_limiter.check_and_record(actor_id).await
        {
            tracing::warn!(actor = actor_id, capability = %request.capability, "Request rate limited");
            return Err(RelayError::RateLimited { retry_after });
        }

        let price = self.quote(actor_id, request.capability, &request.params).await?;
        let reservation = self
            .ledger
            .reserve(actor_id, price)
            .await
            .map_err(reserve_error)?;

        let handle = match self.submitter.submit(&self.provider, &request).await {
            Ok(handle) => handle,
            Err(e) => {
                self.refund(&reservation, None).await;
                return Err(e);
            }
        };

        let mut job = GenerationJob::new(
            handle.job_id.clone(),
            actor_id.to_string(),
            request.capability,
            price,
        );
        let poller = StatusPoller::new(&self.provider, &self.poll, &self.lexicon, &self.decoder);
        let outcome = poller.poll_until_terminal(&mut job, &handle, cancel).await;

        self.conclude(job, handle, reservation, outcome).await
    }

    /// Check a pending job once and settle it if the provider has finished.
    ///
    /// A success whose artifact does not decode yet stays pending, up to the
    /// poller's artifact retry cap across reconciliations.
    pub async fn reconcile(&self, job_id: &str) -> Result<JobOutcome, RelayError> {
        // Taken out of the registry so two reconciliations cannot both settle it.
        let mut pending = self
            .pending
            .lock()
            .await
            .remove(job_id)
            .ok_or_else(|| RelayError::UnknownJob(job_id.to_string()))?;

        pending.job.record_poll();
        let report = match self.provider.status(&pending.handle).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Reconciliation status check failed");
                return Ok(self.repark(pending).await);
            }
        };

        let outcome = match self.lexicon.classify(&report.status) {
            ProviderStatus::Succeeded => {
                let media = pending.job.capability.media_kind();
                let decoded = report
                    .result
                    .as_ref()
                    .map(|payload| self.decoder.decode(payload, media));
                let exhausted = pending.artifact_checks >= self.poll.artifact_retry_cap;
                match decoded {
                    Some(Ok(artifact)) => PollOutcome::Succeeded(artifact),
                    Some(Err(e)) if exhausted => {
                        StateMachine::fail(&mut pending.job, FailureReason::NoArtifactFound);
                        PollOutcome::NoArtifact(e)
                    }
                    None if exhausted => {
                        let reason = FailureReason::ArtifactNeverAttached {
                            attempts: pending.artifact_checks,
                        };
                        StateMachine::fail(&mut pending.job, reason.clone());
                        PollOutcome::Exhausted(reason)
                    }
                    _ => {
                        pending.artifact_checks += 1;
                        tracing::debug!(
                            job_id,
                            attempt = pending.artifact_checks,
                            "Success without artifact, leaving pending"
                        );
                        return Ok(self.repark(pending).await);
                    }
                }
            }
            ProviderStatus::Failed => {
                let message = report
                    .error
                    .unwrap_or_else(|| format!("provider reported {}", report.status));
                StateMachine::fail(
                    &mut pending.job,
                    FailureReason::ProviderFailed(message.clone()),
                );
                PollOutcome::Failed(message)
            }
            ProviderStatus::Queued | ProviderStatus::InProgress => {
                tracing::debug!(job_id, status = %report.status, "Job still running");
                pending.artifact_checks = 0;
                return Ok(self.repark(pending).await);
            }
        };

        tracing::info!(job_id, "Reconciling pending job");
        let PendingJob {
            reservation,
            job,
            handle,
            ..
        } = pending;
        self.conclude(job, handle, reservation, outcome).await
    }

    /// Jobs waiting for reconciliation.
    pub async fn pending_jobs(&self) -> Vec<JobSummary> {
        self.pending
            .lock()
            .await
            .values()
            .map(|p| JobSummary::from_job(&p.job))
            .collect()
    }

    async fn conclude(
        &self,
        mut job: GenerationJob,
        handle: JobHandle,
        reservation: Reservation,
        outcome: PollOutcome,
    ) -> Result<JobOutcome, RelayError> {
        match outcome {
            PollOutcome::Succeeded(artifact) => self.complete(job, reservation, artifact).await,
            PollOutcome::NoArtifact(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    actor = %job.actor_id,
                    error = %e,
                    "Completed job has no usable artifact"
                );
                self.refund(&reservation, Some(&mut job)).await;
                Err(RelayError::NoArtifactFound {
                    job_id: job.job_id,
                    detail: e.to_string(),
                })
            }
            PollOutcome::Failed(message) => {
                self.refund(&reservation, Some(&mut job)).await;
                Err(RelayError::ProviderFailed {
                    job_id: job.job_id,
                    message,
                })
            }
            PollOutcome::Exhausted(reason) => {
                self.refund(&reservation, Some(&mut job)).await;
                Err(RelayError::PollingExhausted {
                    job_id: job.job_id,
                    detail: reason.to_string(),
                })
            }
            PollOutcome::TimedOut => {
                Ok(self.park(job, handle, reservation, PendingReason::TimedOut).await)
            }
            PollOutcome::Cancelled => {
                Ok(self.park(job, handle, reservation, PendingReason::Cancelled).await)
            }
        }
    }

    async fn complete(
        &self,
        mut job: GenerationJob,
        reservation: Reservation,
        artifact: Artifact,
    ) -> Result<JobOutcome, RelayError> {
        // A timed-out job stays TimedOut in its history even if it finished later.
        if let Transition::Rejected { from, .. } =
            StateMachine::complete(&mut job, artifact.urls.clone())
        {
            tracing::debug!(job_id = %job.job_id, state = %from, "Late completion of terminal job");
        }

        let charged = match self.ledger.settle(&reservation, Settlement::Success).await? {
            SettleOutcome::Settled(receipt) => receipt.charged,
            SettleOutcome::AlreadySettled => Decimal::ZERO,
        };
        job.record_settlement(charged);
        let remaining = self.ledger.account(&job.actor_id).await.available();

        let summary = JobSummary::from_job(&job);
        tracing::info!(
            job_id = %job.job_id,
            actor = %job.actor_id,
            capability = %job.capability,
            %charged,
            %remaining,
            polls = summary.poll_attempts,
            duration_ms = summary.duration_ms,
            "Job completed"
        );

        Ok(JobOutcome::Completed {
            job_id: job.job_id,
            artifact,
            credits_deducted: charged,
            remaining_credits: remaining,
            summary,
        })
    }

    async fn refund(&self, reservation: &Reservation, job: Option<&mut GenerationJob>) {
        match self.ledger.settle(reservation, Settlement::Refund).await {
            Ok(_) => {
                if let Some(job) = job {
                    job.record_settlement(Decimal::ZERO);
                    tracing::info!(
                        job_id = %job.job_id,
                        actor = %job.actor_id,
                        state = %job.state,
                        refunded = %reservation.amount,
                        "Reservation refunded"
                    );
                }
            }
            Err(e) => tracing::error!(
                actor = %reservation.actor_id,
                reservation = %reservation.id,
                error = %e,
                "Refund failed"
            ),
        }
    }

    async fn park(
        &self,
        job: GenerationJob,
        handle: JobHandle,
        reservation: Reservation,
        reason: PendingReason,
    ) -> JobOutcome {
        self.repark(PendingJob {
            reservation,
            job,
            handle,
            reason,
            artifact_checks: 0,
        })
        .await
    }

    async fn repark(&self, pending: PendingJob) -> JobOutcome {
        let job_id = pending.job.job_id.clone();
        let reason = pending.reason;
        tracing::warn!(
            job_id = %job_id,
            actor = %pending.job.actor_id,
            held = %pending.reservation.amount,
            %reason,
            "Job pending; reservation held for reconciliation"
        );
        self.pending.lock().await.insert(job_id.clone(), pending);
        JobOutcome::Pending { job_id, reason }
    }
}

fn reserve_error(e: LedgerError) -> RelayError {
    match e {
        LedgerError::InsufficientCredits {
            required,
            available,
        } => RelayError::InsufficientCredits {
            required,
            available,
        },
        other => RelayError::Ledger(other),
    }
}
