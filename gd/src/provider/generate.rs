//! Admission-controlled generation round-trip
//!
//! [`Generator::generate`] performs one full submit/poll/fetch cycle and
//! blocks until the task is terminal. Failures are reported, never retried
//! here; resubmission policy belongs to the worker loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{GenerateError, ProviderError};
use super::types::{GenerationParams, ProviderOutput, ProviderStatus, Submission};
use super::GenerationProvider;
use crate::admission::AdmissionController;
use crate::retry::RetryPolicy;

/// Successful generation outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub provider_task_id: String,
    /// Primary result URL picked from the output listing
    pub url: String,
}

/// Tuning knobs for [`Generator`]
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Retry policy for queue-full submission rejections
    pub submit_retry: RetryPolicy,
    /// Retry policy for transient polling errors
    pub poll_retry: RetryPolicy,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Overall ceiling on the poll phase
    pub timeout: Duration,
    /// Sleep between admission-slot attempts
    pub admission_backoff: Duration,
    /// Preferred output node when the provider returns multiple entries
    pub output_node_id: Option<String>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            submit_retry: RetryPolicy::new(4, Duration::from_secs(5)),
            poll_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            admission_backoff: Duration::from_secs(2),
            output_node_id: None,
        }
    }
}

/// Submit a prompt, retrying only queue-full rejections
///
/// Any other submission error fails immediately, as does an accepted
/// submission whose initial status is already terminal.
pub async fn submit_with_retry(
    provider: &dyn GenerationProvider,
    prompt: &str,
    params: &GenerationParams,
    policy: &RetryPolicy,
) -> Result<Submission, GenerateError> {
    debug!("submit_with_retry: called");
    let submission = policy
        .run(
            |_| provider.submit(prompt, params),
            ProviderError::is_queue_full,
        )
        .await
        .map_err(GenerateError::SubmissionFailed)?;

    if !submission.status.is_active() {
        warn!(
            status = %submission.status,
            "submit_with_retry: submission accepted with terminal status"
        );
        return Err(GenerateError::SubmissionFailed(
            ProviderError::InvalidResponse(format!(
                "unexpected initial status {}",
                submission.status
            )),
        ));
    }

    Ok(submission)
}

/// Pick the primary output: the caller-designated node if present,
/// otherwise the first entry
pub(crate) fn pick_output<'a>(outputs: &'a [ProviderOutput], preferred_node: Option<&str>) -> Option<&'a ProviderOutput> {
    if let Some(node) = preferred_node
        && let Some(output) = outputs.iter().find(|o| o.node_id.as_deref() == Some(node))
    {
        return Some(output);
    }
    outputs.first()
}

/// Blocking submit/poll/fetch driver holding an admission slot for the
/// whole round-trip
pub struct Generator {
    provider: Arc<dyn GenerationProvider>,
    admission: Arc<AdmissionController>,
    options: GeneratorOptions,
}

impl Generator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        admission: Arc<AdmissionController>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            provider,
            admission,
            options,
        }
    }

    /// Run one generation to completion
    ///
    /// `on_start` fires after the admission slot is acquired, so it reflects
    /// when work actually began rather than when it was requested. The slot
    /// is released on every exit path when the guard drops. The wait for a
    /// slot is bounded by the overall timeout, so a saturated controller
    /// cannot park a caller forever.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_start: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<GenerationResult, GenerateError> {
        debug!("Generator::generate: waiting for admission slot");
        let _slot = tokio::time::timeout(
            self.options.timeout,
            self.admission.acquire(self.options.admission_backoff),
        )
        .await
        .map_err(|_| GenerateError::AdmissionTimedOut(self.options.timeout))?;
        if let Some(callback) = on_start {
            callback();
        }
        info!("Generator::generate: slot acquired, submitting");

        let submission =
            submit_with_retry(self.provider.as_ref(), prompt, params, &self.options.submit_retry).await?;
        debug!(
            provider_task_id = %submission.provider_task_id,
            initial_status = %submission.status,
            "Generator::generate: submitted"
        );

        let status = self.poll_until_terminal(&submission.provider_task_id).await?;
        if status != ProviderStatus::Success {
            return Err(GenerateError::ProviderReportedFailure(status.to_string()));
        }

        let outputs = self
            .options
            .poll_retry
            .run(
                |_| self.provider.fetch_outputs(&submission.provider_task_id),
                ProviderError::is_retryable_poll,
            )
            .await
            .map_err(|e| GenerateError::PollingFailed(e.to_string()))?;

        let output = pick_output(&outputs, self.options.output_node_id.as_deref())
            .ok_or(GenerateError::OutputMissing)?;

        info!(
            provider_task_id = %submission.provider_task_id,
            url = %output.url,
            "Generator::generate: complete"
        );
        Ok(GenerationResult {
            provider_task_id: submission.provider_task_id,
            url: output.url.clone(),
        })
    }

    /// Poll at a fixed interval until a terminal status or the deadline
    ///
    /// Transient polling errors are retried within the poll-retry budget;
    /// they do not terminate the loop on their own.
    async fn poll_until_terminal(&self, provider_task_id: &str) -> Result<ProviderStatus, GenerateError> {
        let deadline = Instant::now() + self.options.timeout;
        loop {
            if Instant::now() >= deadline {
                warn!(%provider_task_id, "poll_until_terminal: deadline exceeded");
                return Err(GenerateError::PollingTimedOut(self.options.timeout));
            }

            let status = self
                .options
                .poll_retry
                .run(
                    |_| self.provider.poll_status(provider_task_id),
                    ProviderError::is_retryable_poll,
                )
                .await
                .map_err(|e| GenerateError::PollingFailed(e.to_string()))?;

            debug!(%provider_task_id, %status, "poll_until_terminal: status");
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_options() -> GeneratorOptions {
        GeneratorOptions {
            submit_retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: false,
            },
            poll_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: false,
            },
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            admission_backoff: Duration::from_millis(1),
            output_node_id: Some("9".to_string()),
        }
    }

    fn generator(provider: Arc<MockProvider>, options: GeneratorOptions) -> Generator {
        Generator::new(provider, Arc::new(AdmissionController::new(3)), options)
    }

    fn queued_submission() -> Submission {
        Submission::new("abc", ProviderStatus::Queued)
    }

    #[tokio::test]
    async fn test_generate_success() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Ok(ProviderStatus::Queued));
        provider.push_poll(Ok(ProviderStatus::Running));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![ProviderOutput {
            url: "http://x/img.jpg".to_string(),
            file_type: Some("png".to_string()),
            node_id: Some("9".to_string()),
        }]));

        let generator = generator(Arc::clone(&provider), fast_options());
        let result = generator
            .generate("a red circle", &GenerationParams::default(), None)
            .await
            .unwrap();

        assert_eq!(result.provider_task_id, "abc");
        assert_eq!(result.url, "http://x/img.jpg");
        assert_eq!(provider.poll_calls(), 3);
        assert_eq!(generator.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_generate_retries_queue_full_then_succeeds() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..3 {
            provider.push_submit(Err(ProviderError::QueueFull("TASK_QUEUE_MAXED".to_string())));
        }
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![ProviderOutput::new("http://x/img.jpg")]));

        let generator = generator(Arc::clone(&provider), fast_options());
        let result = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap();

        assert_eq!(result.url, "http://x/img.jpg");
        assert_eq!(provider.submit_calls(), 4);
    }

    #[tokio::test]
    async fn test_generate_queue_full_exhaustion_fails() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..4 {
            provider.push_submit(Err(ProviderError::QueueFull("TASK_QUEUE_MAXED".to_string())));
        }

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::SubmissionFailed(_)));
        assert!(err.to_string().to_lowercase().contains("queue"));
        assert_eq!(provider.submit_calls(), 4);
        // Slot released despite the failure
        assert_eq!(generator.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_generate_non_queue_full_submission_fails_immediately() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Err(ProviderError::Api {
            code: 421,
            message: "webapp not exists".to_string(),
        }));

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::SubmissionFailed(_)));
        assert_eq!(provider.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_generate_terminal_initial_status_is_submission_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(Submission::new("abc", ProviderStatus::Fail)));

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::SubmissionFailed(_)));
        assert_eq!(provider.poll_calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_provider_reported_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Ok(ProviderStatus::Fail));

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        match err {
            GenerateError::ProviderReportedFailure(status) => assert_eq!(status, "FAIL"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.output_calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_empty_outputs_is_output_missing() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![]));

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::OutputMissing));
    }

    #[tokio::test]
    async fn test_generate_zero_timeout_times_out() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));

        let options = GeneratorOptions {
            timeout: Duration::ZERO,
            ..fast_options()
        };
        let generator = generator(Arc::clone(&provider), options);
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::PollingTimedOut(_)));
        assert_eq!(provider.poll_calls(), 0);
        assert_eq!(generator.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_generate_transient_poll_errors_are_retried() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Err(ProviderError::InvalidResponse("garbled".to_string())));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![ProviderOutput::new("http://x/img.jpg")]));

        let generator = generator(Arc::clone(&provider), fast_options());
        let result = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap();

        // One malformed status body does not terminate the round-trip
        assert_eq!(result.url, "http://x/img.jpg");
        assert_eq!(provider.poll_calls(), 2);
    }

    #[tokio::test]
    async fn test_generate_poll_retry_budget_exhaustion_fails() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        for _ in 0..3 {
            provider.push_poll(Err(ProviderError::InvalidResponse("garbled".to_string())));
        }

        let generator = generator(Arc::clone(&provider), fast_options());
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::PollingFailed(_)));
        assert_eq!(provider.poll_calls(), 3);
    }

    #[tokio::test]
    async fn test_generate_admission_wait_is_bounded() {
        let provider = Arc::new(MockProvider::new());
        let admission = Arc::new(AdmissionController::new(1));
        let _held = admission.try_acquire_slot().unwrap();

        let options = GeneratorOptions {
            timeout: Duration::from_millis(20),
            ..fast_options()
        };
        let generator = Generator::new(
            Arc::clone(&provider) as Arc<dyn GenerationProvider>,
            Arc::clone(&admission),
            options,
        );
        let err = generator
            .generate("prompt", &GenerationParams::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerateError::AdmissionTimedOut(_)));
        assert_eq!(provider.submit_calls(), 0);
        // The held slot is untouched
        assert_eq!(admission.status().submitted, 1);
    }

    #[tokio::test]
    async fn test_on_start_fires_after_slot_acquisition() {
        let provider = Arc::new(MockProvider::new());
        provider.push_submit(Ok(queued_submission()));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![ProviderOutput::new("http://x/img.jpg")]));

        let admission = Arc::new(AdmissionController::new(1));
        let generator = Generator::new(Arc::clone(&provider) as Arc<dyn GenerationProvider>, Arc::clone(&admission), fast_options());

        let started = Arc::new(AtomicBool::new(false));
        let started_inner = Arc::clone(&started);
        let admission_inner = Arc::clone(&admission);
        let on_start: Box<dyn FnOnce() + Send> = Box::new(move || {
            // Slot already held when the callback runs
            assert_eq!(admission_inner.status().submitted, 1);
            started_inner.store(true, Ordering::SeqCst);
        });

        generator
            .generate("prompt", &GenerationParams::default(), Some(on_start))
            .await
            .unwrap();

        assert!(started.load(Ordering::SeqCst));
        assert_eq!(admission.status().submitted, 0);
    }

    #[test]
    fn test_pick_output_prefers_designated_node() {
        let outputs = vec![
            ProviderOutput {
                url: "http://x/preview.jpg".to_string(),
                file_type: None,
                node_id: Some("31".to_string()),
            },
            ProviderOutput {
                url: "http://x/final.jpg".to_string(),
                file_type: None,
                node_id: Some("9".to_string()),
            },
        ];

        assert_eq!(pick_output(&outputs, Some("9")).unwrap().url, "http://x/final.jpg");
        // Unknown preference falls back to the first entry
        assert_eq!(pick_output(&outputs, Some("42")).unwrap().url, "http://x/preview.jpg");
        assert_eq!(pick_output(&outputs, None).unwrap().url, "http://x/preview.jpg");
        assert!(pick_output(&[], Some("9")).is_none());
    }
}
