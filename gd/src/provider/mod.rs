//! Generation provider client
//!
//! Wraps the external provider's submit/poll/fetch-outputs protocol. The
//! worker loop drives the three primitives directly; [`Generator`] offers
//! the blocking full round-trip for callers that want a single image back.
//!
//! # Modules
//!
//! - [`types`] - Status vocabulary, submissions, outputs, parameters
//! - [`error`] - Provider and generation error taxonomies
//! - [`runninghub`] - RunningHub HTTP implementation
//! - [`generate`] - Admission-controlled submit/poll/fetch round-trip

pub mod error;
pub mod generate;
pub mod runninghub;
pub mod types;

use async_trait::async_trait;

pub use error::{GenerateError, ProviderError};
pub use generate::{GenerationResult, Generator, GeneratorOptions, submit_with_retry};
pub use runninghub::RunningHubClient;
pub use types::{GenerationParams, ProviderOutput, ProviderStatus, Submission};

/// External generation provider protocol
///
/// Each call is independent; the provider's task handle carries all state.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a prompt, returning the provider's task handle and initial
    /// status
    async fn submit(&self, prompt: &str, params: &GenerationParams) -> Result<Submission, ProviderError>;

    /// Query the current status of a submitted task
    async fn poll_status(&self, provider_task_id: &str) -> Result<ProviderStatus, ProviderError>;

    /// Fetch the output listing of a task the provider reports as SUCCESS
    async fn fetch_outputs(&self, provider_task_id: &str) -> Result<Vec<ProviderOutput>, ProviderError>;
}
