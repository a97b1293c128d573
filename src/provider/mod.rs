pub mod client;
pub mod error;
pub mod scripted;
pub mod types;

use std::future::Future;

pub use client::HttpProvider;
pub use error::ProviderError;
pub use scripted::{ScriptStep, ScriptedProvider, SubmitScript};
pub use types::{JobHandle, ProviderRequest, ProviderStatus, StatusLexicon, StatusReport};

/// A generation backend that accepts jobs and reports on them.
pub trait JobProvider: Send + Sync {
    fn submit(
        &self,
        request: &ProviderRequest,
    ) -> impl Future<Output = Result<JobHandle, ProviderError>> + Send;

    fn status(
        &self,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<StatusReport, ProviderError>> + Send;
}
