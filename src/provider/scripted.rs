//! In-process provider that replays a fixed script of responses.
//!
//! Used by `genrelay demo` and by tests that need exact control over what a
//! provider answers, including transport failures.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use super::JobProvider;
use super::error::ProviderError;
use super::types::{JobHandle, ProviderRequest, StatusReport};

/// One scripted answer to a status poll.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Report(StatusReport),
    TransportError(String),
}

/// One scripted answer to a submission.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    Accept(String),
    Reject(String),
    Unavailable(String),
}

pub struct ScriptedProvider {
    submit: SubmitScript,
    steps: Mutex<VecDeque<ScriptStep>>,
    // Returned once the script runs out.
    fallback: StatusReport,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
}

impl ScriptedProvider {
    /// A provider that accepts submissions as `job_id` and then replays `steps`.
    pub fn new(job_id: &str, steps: Vec<ScriptStep>) -> Self {
        Self {
            submit: SubmitScript::Accept(job_id.to_string()),
            steps: Mutex::new(steps.into()),
            fallback: StatusReport::in_progress(),
            submit_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        }
    }

    /// Status polls answered once the script is exhausted.
    pub fn with_fallback(mut self, report: StatusReport) -> Self {
        self.fallback = report;
        self
    }

    pub fn with_submit(mut self, submit: SubmitScript) -> Self {
        self.submit = submit;
        self
    }

    /// Append more steps (e.g. to script a late completion for reconciliation).
    pub fn push(&self, step: ScriptStep) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl JobProvider for ScriptedProvider {
    async fn submit(&self, request: &ProviderRequest) -> Result<JobHandle, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        match &self.submit {
            SubmitScript::Accept(job_id) => Ok(JobHandle {
                endpoint: request.endpoint.clone(),
                job_id: job_id.clone(),
            }),
            SubmitScript::Reject(message) => Err(ProviderError::Rejected {
                status: 400,
                message: message.clone(),
            }),
            SubmitScript::Unavailable(message) => Err(ProviderError::Unavailable {
                status: 503,
                message: message.clone(),
            }),
        }
    }

    async fn status(&self, _handle: &JobHandle) -> Result<StatusReport, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front());
        match step {
            Some(ScriptStep::Report(report)) => Ok(report),
            Some(ScriptStep::TransportError(message)) => Err(ProviderError::Unavailable {
                status: 502,
                message,
            }),
            None => Ok(self.fallback.clone()),
        }
    }
}
