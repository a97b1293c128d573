//! Credit-gated orchestration of long-running generative AI jobs.
//!
//! A job is priced, its credits are reserved, it is submitted to a provider,
//! polled until the provider finishes, its artifact URL is decoded from the
//! result, and the reservation is settled exactly once.

pub mod cli;
pub mod config;
pub mod decoder;
pub mod discount;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod poller;
pub mod pricing;
pub mod provider;
pub mod rate_limit;
pub mod state_machine;
pub mod submitter;
pub mod ui;

pub use config::RelayConfig;
pub use decoder::{Artifact, ResultDecoder};
pub use error::RelayError;
pub use ledger::{CreditLedger, InMemoryLedger};
pub use orchestrator::{JobOrchestrator, JobOutcome, PendingReason};
pub use pricing::Capability;
pub use provider::{HttpProvider, JobProvider, ProviderRequest};
