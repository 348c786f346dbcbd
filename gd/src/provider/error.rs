//! Provider and generation error taxonomies
//!
//! [`ProviderError`] covers a single HTTP exchange with the provider;
//! [`GenerateError`] covers the full submit/poll/fetch round-trip.

use std::time::Duration;

use thiserror::Error;

/// Error from one provider API call
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider rejected the submission because its own queue is full
    #[error("Provider queue is full: {0}")]
    QueueFull(String),

    /// Provider returned a non-success application code
    #[error("Provider API error (code {code}): {message}")]
    Api { code: i64, message: String },

    /// Transport-level failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response did not match the expected envelope shape
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_queue_full(&self) -> bool {
        matches!(self, ProviderError::QueueFull(_))
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::QueueFull(_) => true,
            ProviderError::Network(_) => true,
            ProviderError::Api { .. } => false,
            ProviderError::InvalidResponse(_) => false,
        }
    }

    /// Whether a status-poll or output-fetch attempt is worth repeating
    ///
    /// Polling also retries malformed responses: a garbled status body for
    /// an already-accepted task is transient from the poll loop's point of
    /// view and must not terminate it by itself. During submission the same
    /// error stays fatal, since it means the request was not understood.
    pub fn is_retryable_poll(&self) -> bool {
        self.is_retryable() || matches!(self, ProviderError::InvalidResponse(_))
    }
}

/// Error from a full generation round-trip
#[derive(Debug, Error)]
pub enum GenerateError {
    /// No admission slot freed up within the overall timeout
    #[error("No admission slot became available within {0:?}")]
    AdmissionTimedOut(Duration),

    /// Submission never got accepted, queue-full retries included
    #[error("Submission failed: {0}")]
    SubmissionFailed(#[source] ProviderError),

    /// Task stayed active past the polling deadline
    #[error("Generation did not finish within {0:?}")]
    PollingTimedOut(Duration),

    /// Polling itself kept failing and the retry budget ran out
    #[error("Status polling failed: {0}")]
    PollingFailed(String),

    /// Provider reported the task as FAIL or CANCEL
    #[error("Provider reported failure: {0}")]
    ProviderReportedFailure(String),

    /// Task succeeded but the output listing had no usable entry
    #[error("Task succeeded but produced no output")]
    OutputMissing,
}
