//! Job submission with a bounded timeout and error classification.
//!
//! A submission either yields a provider job handle or one of two errors:
//! `SubmissionRejected` (the provider refused; retrying the same request is
//! pointless) or `SubmissionUnavailable` (5xx, network, non-JSON, timeout).
//! After a timeout the provider may or may not have created a job; it is
//! reported as unavailable and no handle is assumed. There is no internal retry.

use std::time::Duration;

use tokio::time::timeout;

use crate::error::RelayError;
use crate::provider::{JobHandle, JobProvider, ProviderError, ProviderRequest};

#[derive(Debug, Clone)]
pub struct SubmitConfig {
    pub timeout: Duration,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct JobSubmitter {
    config: SubmitConfig,
}

impl JobSubmitter {
    pub fn new(config: SubmitConfig) -> Self {
        Self { config }
    }

    pub async fn submit<P: JobProvider>(
        &self,
        provider: &P,
        request: &ProviderRequest,
    ) -> Result<JobHandle, RelayError> {
        let result = timeout(self.config.timeout, provider.submit(request)).await;

        match result {
            Ok(Ok(handle)) => {
                tracing::info!(
                    job_id = %handle.job_id,
                    endpoint = %handle.endpoint,
                    capability = %request.capability,
                    "Job submitted"
                );
                Ok(handle)
            }
            Ok(Err(ProviderError::Rejected { status, message })) => {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    status,
                    error = %message,
                    "Submission rejected"
                );
                Err(RelayError::SubmissionRejected { message })
            }
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %request.endpoint, error = %e, "Submission failed");
                Err(RelayError::SubmissionUnavailable {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Submission timed out; provider-side outcome unknown"
                );
                Err(RelayError::SubmissionUnavailable {
                    message: format!(
                        "no response within {}s",
                        self.config.timeout.as_secs()
                    ),
                })
            }
        }
    }
}

impl Default for JobSubmitter {
    fn default() -> Self {
        Self::new(SubmitConfig::default())
    }
}
