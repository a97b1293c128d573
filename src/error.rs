use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::pricing::PricingError;

/// Everything that can stop a paid generation job.
///
/// `Display` carries diagnostic detail for logs. Anything shown to an end user
/// goes through [`RelayError::user_message`] instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: Decimal,
        available: Decimal,
    },

    #[error("submission rejected: {message}")]
    SubmissionRejected { message: String },

    #[error("submission unavailable: {message}")]
    SubmissionUnavailable { message: String },

    #[error("polling exhausted for job {job_id}: {detail}")]
    PollingExhausted { job_id: String, detail: String },

    #[error("provider failed job {job_id}: {message}")]
    ProviderFailed { job_id: String, message: String },

    #[error("no artifact found for job {job_id}: {detail}")]
    NoArtifactFound { job_id: String, detail: String },

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid request: {0}")]
    InvalidParams(String),

    #[error("unknown pending job: {0}")]
    UnknownJob(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<PricingError> for RelayError {
    fn from(e: PricingError) -> Self {
        match e {
            PricingError::UnknownCapability(capability) => RelayError::UnknownCapability(capability),
            invalid @ PricingError::InvalidParam { .. } => RelayError::InvalidParams(invalid.to_string()),
        }
    }
}

impl RelayError {
    /// Whether credits held for this job were released.
    pub fn refunded(&self) -> bool {
        matches!(
            self,
            RelayError::SubmissionRejected { .. }
                | RelayError::SubmissionUnavailable { .. }
                | RelayError::PollingExhausted { .. }
                | RelayError::ProviderFailed { .. }
                | RelayError::NoArtifactFound { .. }
        )
    }

    /// Whether the caller may run the whole flow again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::RateLimited { .. }
                | RelayError::SubmissionUnavailable { .. }
                | RelayError::PollingExhausted { .. }
        )
    }

    /// Sanitized text for end users: no provider payloads, no internals.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::RateLimited { .. } => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            RelayError::InsufficientCredits {
                required,
                available,
            } => format!(
                "Not enough credits: this generation costs {required}, you have {available}."
            ),
            RelayError::SubmissionRejected { .. } => {
                "The generation request was rejected. Please check your inputs. No credits were charged."
                    .into()
            }
            RelayError::SubmissionUnavailable { .. } => {
                "The generation service is temporarily unavailable. No credits were charged; please try again."
                    .into()
            }
            RelayError::PollingExhausted { job_id, .. } => format!(
                "Lost contact with the generation service. Your credits were refunded. Reference: {job_id}"
            ),
            RelayError::ProviderFailed { .. } => {
                "Generation failed. Your credits were refunded.".into()
            }
            RelayError::NoArtifactFound { job_id, .. } => format!(
                "The job finished but its output could not be retrieved. Your credits were refunded. Reference: {job_id}"
            ),
            RelayError::InvalidParams(_) => {
                "Some generation settings are invalid. Please review them.".into()
            }
            RelayError::UnknownCapability(_) => {
                "This kind of generation is not available.".into()
            }
            _ => "Something went wrong. Please try again.".into(),
        }
    }
}
