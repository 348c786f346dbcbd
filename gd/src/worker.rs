//! Worker loop driving the task state machine
//!
//! A single-threaded loop runs every poll interval and performs four passes
//! in order, each over a bounded batch:
//!
//! 1. Submit: PENDING tasks are submitted to the provider (SUBMITTED)
//! 2. Poll: active tasks are reconciled with provider status
//! 3. Timeout sweep: stale active tasks become TIMEOUT
//! 4. Retry sweep: FAILED tasks with budget left return to PENDING
//!
//! Task-level errors stay inside their pass; only store-level failures
//! escape an iteration and feed the loop's backoff and reinitialization
//! machinery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result, eyre};
use genstore::{Task, TaskStatus, TaskStore, TaskUpdate};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, SlotGuard};
use crate::config::Config;
use crate::provider::generate::pick_output;
use crate::provider::{GenerationParams, GenerationProvider, ProviderStatus, submit_with_retry};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStorage;

/// Everything the worker talks to; rebuilt wholesale on reinitialization
pub struct Components {
    pub store: Arc<dyn TaskStore>,
    pub provider: Arc<dyn GenerationProvider>,
    pub storage: Arc<dyn ObjectStorage>,
}

/// Builds a fresh set of components, used at startup and during recovery
pub type ComponentFactory = Box<dyn Fn() -> Result<Components> + Send>;

/// Storage key for a task's generated asset
///
/// Layout: `{drama}/{episode}/{characters|scenes|props}/{name}.jpg`,
/// falling back to the entity id when no name was recorded.
pub fn storage_key(task: &Task) -> String {
    let drama = task.drama_name.as_deref().unwrap_or("unsorted");
    let episode = task.episode_number.unwrap_or(0);
    let name = match task.entity_name.as_deref() {
        Some(name) => name.to_string(),
        None => format!("entity-{}", task.entity_id),
    };
    format!(
        "{}/{}/{}/{}.jpg",
        drama,
        episode,
        task.entity_type.storage_segment(),
        name
    )
}

/// Backoff applied after a failed iteration, growing with consecutive
/// failures up to a fixed cap
fn error_backoff(poll_interval: Duration, consecutive_errors: u32, cap: Duration) -> Duration {
    poll_interval
        .saturating_mul(consecutive_errors.max(1))
        .min(cap)
}

pub struct Worker {
    config: Config,
    components: Components,
    factory: ComponentFactory,
    admission: Arc<AdmissionController>,
    /// Admission slots held for in-flight submissions, keyed by provider
    /// task handle; dropped (released) when the task leaves the active set
    slots: HashMap<String, SlotGuard>,
    submit_retry: RetryPolicy,
    consecutive_errors: u32,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(config: Config, factory: ComponentFactory, shutdown: watch::Receiver<bool>) -> Result<Self> {
        debug!("Worker::new: called");
        let components = factory().context("Failed to initialize worker components")?;
        let admission = Arc::new(AdmissionController::new(config.admission.max_concurrent));
        let submit_retry = RetryPolicy::new(
            config.provider.submit_max_attempts,
            Duration::from_secs(config.provider.submit_base_delay_secs),
        );

        Ok(Self {
            config,
            components,
            factory,
            admission,
            slots: HashMap::new(),
            submit_retry,
            consecutive_errors: 0,
            shutdown,
        })
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    /// Run until the shutdown signal fires
    ///
    /// An in-progress iteration always finishes; shutdown is only observed
    /// between iterations and during sleeps.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval_secs = self.config.worker.poll_interval_secs,
            "Worker::run: started"
        );

        loop {
            if *self.shutdown.borrow() {
                info!("Worker::run: shutdown requested, exiting");
                return Ok(());
            }

            match self.run_iteration().await {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    let interval = Duration::from_secs(self.config.worker.poll_interval_secs);
                    if self.sleep_or_shutdown(interval).await {
                        info!("Worker::run: shutdown requested, exiting");
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    error!(
                        consecutive_errors = self.consecutive_errors,
                        error = %e,
                        "Worker::run: iteration failed"
                    );

                    if self.consecutive_errors >= self.config.worker.max_consecutive_errors {
                        if self.reinitialize().await {
                            info!("Worker::run: shutdown requested during recovery, exiting");
                            return Ok(());
                        }
                        continue;
                    }

                    let backoff = error_backoff(
                        Duration::from_secs(self.config.worker.poll_interval_secs),
                        self.consecutive_errors,
                        Duration::from_secs(self.config.worker.error_backoff_cap_secs),
                    );
                    if self.sleep_or_shutdown(backoff).await {
                        info!("Worker::run: shutdown requested, exiting");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One iteration: the four passes in order
    pub async fn run_iteration(&mut self) -> Result<()> {
        debug!("Worker::run_iteration: called");
        self.submit_pass().await?;
        self.poll_pass().await?;
        self.timeout_sweep()?;
        self.retry_sweep()?;
        Ok(())
    }

    /// Submit PENDING tasks, bounded by the batch size and by free
    /// admission slots; tasks that find no slot wait for a later iteration
    async fn submit_pass(&mut self) -> Result<()> {
        let batch = self.config.worker.pending_batch_size as usize;
        let pending = self.components.store.pending_tasks(batch)?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "Worker::submit_pass: processing batch");

        for task in pending {
            let Some(slot) = self.admission.try_acquire_slot() else {
                debug!(task_id = task.id, "Worker::submit_pass: no admission slot, deferring");
                break;
            };

            let params = GenerationParams::default();
            match submit_with_retry(
                self.components.provider.as_ref(),
                &task.prompt,
                &params,
                &self.submit_retry,
            )
            .await
            {
                Ok(submission) => {
                    self.components
                        .store
                        .update_task(task.id, &TaskUpdate::submitted(&submission.provider_task_id))?;
                    info!(
                        task_id = task.id,
                        provider_task_id = %submission.provider_task_id,
                        "Worker::submit_pass: task submitted"
                    );
                    self.slots.insert(submission.provider_task_id, slot);
                }
                Err(e) => {
                    // Slot drops here; retry bookkeeping happens in the
                    // retry sweep, not at the point of failure
                    warn!(task_id = task.id, error = %e, "Worker::submit_pass: submission failed");
                    self.components
                        .store
                        .update_task(task.id, &TaskUpdate::failed(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Reconcile active tasks with provider-reported status
    async fn poll_pass(&mut self) -> Result<()> {
        let batch = self.config.worker.active_batch_size as usize;
        let active = self.components.store.active_tasks(batch)?;
        if active.is_empty() {
            return Ok(());
        }
        debug!(count = active.len(), "Worker::poll_pass: processing batch");

        for task in active {
            let Some(provider_task_id) = task.provider_task_id.clone() else {
                warn!(task_id = task.id, "Worker::poll_pass: active task has no provider handle");
                self.components
                    .store
                    .update_task(task.id, &TaskUpdate::failed("active task missing provider handle"))?;
                continue;
            };

            let status = match self.components.provider.poll_status(&provider_task_id).await {
                Ok(status) => status,
                Err(e) => {
                    // Transient; the timeout sweep is the backstop for
                    // tasks that never produce a pollable status
                    warn!(task_id = task.id, error = %e, "Worker::poll_pass: poll failed, will retry next iteration");
                    continue;
                }
            };
            debug!(task_id = task.id, %status, "Worker::poll_pass: provider status");

            match status {
                ProviderStatus::Queued | ProviderStatus::Running => {
                    let new_status = if status == ProviderStatus::Queued {
                        TaskStatus::Queued
                    } else {
                        TaskStatus::Running
                    };
                    // Write back only on change
                    if task.status != new_status {
                        self.components
                            .store
                            .update_task(task.id, &TaskUpdate::status(new_status))?;
                    }
                }
                ProviderStatus::Success => {
                    if let Err(e) = self.complete_task(&task, &provider_task_id).await {
                        warn!(task_id = task.id, error = %e, "Worker::poll_pass: post-processing failed");
                        // {:#} keeps the cause chain, not just the outer context
                        self.components
                            .store
                            .update_task(task.id, &TaskUpdate::failed(format!("post-processing failed: {e:#}")))?;
                    }
                    self.slots.remove(&provider_task_id);
                }
                ProviderStatus::Fail | ProviderStatus::Cancel => {
                    self.components
                        .store
                        .update_task(task.id, &TaskUpdate::failed(format!("provider reported {status}")))?;
                    self.slots.remove(&provider_task_id);
                }
            }
        }
        Ok(())
    }

    /// Post-processing for a provider SUCCESS: fetch the output, persist it
    /// to object storage, update the owning entity, mark the task SUCCESS
    async fn complete_task(&self, task: &Task, provider_task_id: &str) -> Result<()> {
        let outputs = self
            .components
            .provider
            .fetch_outputs(provider_task_id)
            .await
            .context("Failed to fetch task outputs")?;

        let output = pick_output(&outputs, Some(&self.config.provider.output_node_id))
            .ok_or_else(|| eyre!("task succeeded but produced no output"))?;

        let key = storage_key(task);
        let cdn_url = self
            .components
            .storage
            .upload_from_url(&output.url, &key)
            .await
            .context("Failed to persist output to object storage")?;

        self.components
            .store
            .update_entity_image(task.entity_type, task.entity_id, &cdn_url, &task.prompt)?;

        self.components
            .store
            .update_task(task.id, &TaskUpdate::success(&cdn_url, &key))?;
        info!(task_id = task.id, %cdn_url, "Worker::complete_task: task succeeded");
        Ok(())
    }

    /// Mark active tasks whose submission is older than the timeout
    /// threshold; a pure staleness check, no provider calls
    fn timeout_sweep(&mut self) -> Result<()> {
        let timeout_minutes = self.config.worker.task_timeout_minutes as i64;
        let stale = self.components.store.timed_out_tasks(timeout_minutes)?;

        for task in stale {
            warn!(task_id = task.id, "Worker::timeout_sweep: task timed out");
            self.components.store.update_task(
                task.id,
                &TaskUpdate::timeout(format!("no terminal status after {timeout_minutes} minutes")),
            )?;
            if let Some(provider_task_id) = &task.provider_task_id {
                self.slots.remove(provider_task_id);
            }
        }
        Ok(())
    }

    /// Return FAILED tasks with budget left to PENDING
    fn retry_sweep(&mut self) -> Result<()> {
        let retryable = self.components.store.retryable_tasks()?;

        for task in retryable {
            info!(
                task_id = task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "Worker::retry_sweep: resetting task for retry"
            );
            self.components.store.reset_for_retry(task.id)?;
        }
        Ok(())
    }

    /// Rebuild all components after repeated iteration failures
    ///
    /// Held admission slots are dropped first so the fresh components start
    /// from a clean in-flight count. Returns true if shutdown fired while
    /// waiting for a recovery attempt.
    async fn reinitialize(&mut self) -> bool {
        let recovery_wait = Duration::from_secs(self.config.worker.recovery_wait_secs);
        self.slots.clear();

        loop {
            warn!("Worker::reinitialize: rebuilding components");
            match (self.factory)() {
                Ok(components) => {
                    self.components = components;
                    self.consecutive_errors = 0;
                    info!("Worker::reinitialize: components rebuilt");
                    return false;
                }
                Err(e) => {
                    error!(error = %e, recovery_wait_secs = recovery_wait.as_secs(), "Worker::reinitialize: failed, waiting before retry");
                    if self.sleep_or_shutdown(recovery_wait).await {
                        return true;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`, returning true if shutdown fired first
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.shutdown.borrow(),
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::provider::mock::MockProvider;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use genstore::{EntityType, NewTask};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store that counts update calls, for idempotency checks
    #[derive(Default)]
    struct MemoryTaskStore {
        tasks: Mutex<Vec<Task>>,
        entity_updates: Mutex<Vec<(EntityType, i64, String)>>,
        update_calls: AtomicUsize,
    }

    impl MemoryTaskStore {
        fn update_calls(&self) -> usize {
            self.update_calls.load(Ordering::SeqCst)
        }

        fn set_submitted_at(&self, id: i64, at: chrono::DateTime<Utc>) {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks.iter_mut().find(|t| t.id == id).unwrap();
            task.submitted_at = Some(at);
        }

        fn task(&self, id: i64) -> Task {
            self.tasks.lock().unwrap().iter().find(|t| t.id == id).unwrap().clone()
        }
    }

    impl TaskStore for MemoryTaskStore {
        fn create_task(&self, new: &NewTask) -> Result<i64> {
            let mut tasks = self.tasks.lock().unwrap();
            let id = tasks.len() as i64 + 1;
            tasks.push(Task {
                id,
                task_type: new.task_type,
                entity_type: new.entity_type,
                entity_id: new.entity_id,
                prompt: new.prompt.clone(),
                drama_name: new.drama_name.clone(),
                episode_number: new.episode_number,
                entity_name: new.entity_name.clone(),
                status: TaskStatus::Pending,
                provider_task_id: None,
                result_url: None,
                storage_key: None,
                error_message: None,
                retry_count: 0,
                max_retries: new.max_retries,
                created_at: Utc::now(),
                submitted_at: None,
                completed_at: None,
                last_poll_at: None,
            });
            Ok(id)
        }

        fn get_task(&self, id: i64) -> Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().iter().find(|t| t.id == id).cloned())
        }

        fn get_task_by_provider_id(&self, provider_task_id: &str) -> Result<Option<Task>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.provider_task_id.as_deref() == Some(provider_task_id))
                .cloned())
        }

        fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                return Ok(false);
            };
            if let Some(status) = update.status {
                task.status = status;
                match status {
                    TaskStatus::Submitted => task.submitted_at = Some(Utc::now()),
                    TaskStatus::Queued | TaskStatus::Running => task.last_poll_at = Some(Utc::now()),
                    TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout => {
                        task.completed_at = Some(Utc::now())
                    }
                    TaskStatus::Pending => {}
                }
            }
            if let Some(handle) = &update.provider_task_id {
                task.provider_task_id = handle.clone();
            }
            if let Some(url) = &update.result_url {
                task.result_url = Some(url.clone());
            }
            if let Some(key) = &update.storage_key {
                task.storage_key = Some(key.clone());
            }
            if let Some(message) = &update.error_message {
                task.error_message = message.clone();
            }
            if update.increment_retry {
                task.retry_count += 1;
            }
            Ok(true)
        }

        fn pending_tasks(&self, limit: usize) -> Result<Vec<Task>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        }

        fn active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status.is_active())
                .take(limit)
                .cloned()
                .collect())
        }

        fn timed_out_tasks(&self, timeout_minutes: i64) -> Result<Vec<Task>> {
            let cutoff = Utc::now() - ChronoDuration::minutes(timeout_minutes);
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status.is_active() && t.submitted_at.is_some_and(|at| at < cutoff))
                .cloned()
                .collect())
        }

        fn retryable_tasks(&self) -> Result<Vec<Task>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status == TaskStatus::Failed && t.retry_count < t.max_retries)
                .cloned()
                .collect())
        }

        fn update_entity_image(
            &self,
            entity_type: EntityType,
            entity_id: i64,
            image_url: &str,
            _prompt: &str,
        ) -> Result<()> {
            self.entity_updates
                .lock()
                .unwrap()
                .push((entity_type, entity_id, image_url.to_string()));
            Ok(())
        }

        fn cleanup_old_tasks(&self, _days: i64) -> Result<usize> {
            Ok(0)
        }

        fn task_stats(&self) -> Result<BTreeMap<String, i64>> {
            let mut stats = BTreeMap::new();
            for task in self.tasks.lock().unwrap().iter() {
                *stats.entry(task.status.as_str().to_string()).or_insert(0) += 1;
            }
            Ok(stats)
        }
    }

    /// Storage stub mapping keys onto a fixed CDN base
    struct MemoryStorage;

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn upload_from_url(&self, source_url: &str, _key: &str) -> Result<String, crate::storage::StorageError> {
            Ok(format!("https://cdn/{}", source_url.trim_start_matches("http://")))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.worker.poll_interval_secs = 1;
        config.provider.submit_max_attempts = 4;
        config.provider.submit_base_delay_secs = 0;
        config.provider.output_node_id = "9".to_string();
        config
    }

    fn worker_with(
        store: Arc<MemoryTaskStore>,
        provider: Arc<MockProvider>,
        config: Config,
    ) -> (Worker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let factory: ComponentFactory = Box::new(move || {
            Ok(Components {
                store: Arc::clone(&store) as Arc<dyn TaskStore>,
                provider: Arc::clone(&provider) as Arc<dyn GenerationProvider>,
                storage: Arc::new(MemoryStorage),
            })
        });
        let worker = Worker::new(config, factory, rx).unwrap();
        (worker, tx)
    }

    fn new_task(store: &MemoryTaskStore) -> i64 {
        let mut new = NewTask::new(EntityType::Character, 7, "a red circle");
        new.drama_name = Some("demo-drama".to_string());
        new.episode_number = Some(1);
        new.entity_name = Some("hero".to_string());
        store.create_task(&new).unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_success() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);

        provider.push_submit(Ok(crate::provider::Submission::new("abc", ProviderStatus::Queued)));
        provider.push_poll(Ok(ProviderStatus::Queued));
        provider.push_poll(Ok(ProviderStatus::Running));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![crate::provider::ProviderOutput::new("http://x/img.jpg")]));

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());

        // Iteration 1: submit + first poll (QUEUED)
        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Queued);
        assert_eq!(store.task(id).provider_task_id.as_deref(), Some("abc"));
        assert_eq!(worker.admission.status().submitted, 1);

        // Iteration 2: RUNNING
        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Running);

        // Iteration 3: SUCCESS with post-processing
        worker.run_iteration().await.unwrap();
        let task = store.task(id);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result_url.as_deref(), Some("https://cdn/x/img.jpg"));
        assert_eq!(
            task.storage_key.as_deref(),
            Some("demo-drama/1/characters/hero.jpg")
        );
        let updates = store.entity_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, EntityType::Character);
        assert_eq!(updates[0].1, 7);
        assert_eq!(updates[0].2, "https://cdn/x/img.jpg");
        drop(updates);

        // Slot released once the task left the active set
        assert_eq!(worker.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_unchanged_poll_status_writes_nothing() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);

        provider.push_submit(Ok(crate::provider::Submission::new("abc", ProviderStatus::Queued)));
        provider.push_poll(Ok(ProviderStatus::Running));
        provider.push_poll(Ok(ProviderStatus::Running));

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());

        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Running);
        let writes_after_first = store.update_calls();

        worker.run_iteration().await.unwrap();
        // Second identical poll produced no write
        assert_eq!(store.update_calls(), writes_after_first);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);
        // Every submission attempt fails outright
        for _ in 0..16 {
            provider.push_submit(Err(ProviderError::Api {
                code: 500,
                message: "internal".to_string(),
            }));
        }

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());

        // max_retries + 2 iterations of fail-then-sweep
        for _ in 0..5 {
            worker.run_iteration().await.unwrap();
        }

        let task = store.task(id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, task.max_retries);
        // Initial attempt plus max_retries resubmissions
        assert_eq!(provider.submit_calls(), (task.max_retries + 1) as usize);
        // All slots released
        assert_eq!(worker.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_queue_full_exhaustion_records_queue_error() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);
        for _ in 0..4 {
            provider.push_submit(Err(ProviderError::QueueFull("TASK_QUEUE_MAXED".to_string())));
        }

        let mut config = test_config();
        config.provider.submit_max_attempts = 4;
        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), config);

        // Submit pass alone, so the retry sweep does not reset the task
        // before we can observe the recorded failure
        worker.submit_pass().await.unwrap();

        let task = store.task(id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().to_lowercase().contains("queue"));
        assert_eq!(provider.submit_calls(), 4);
        assert_eq!(worker.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_timeout_sweep_is_independent_of_polling() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);

        provider.push_submit(Ok(crate::provider::Submission::new("abc", ProviderStatus::Queued)));
        // Provider keeps reporting RUNNING forever
        for _ in 0..8 {
            provider.push_poll(Ok(ProviderStatus::Running));
        }

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());
        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Running);

        // Backdate the submission past the 30 minute threshold
        store.set_submitted_at(id, Utc::now() - ChronoDuration::minutes(31));
        worker.run_iteration().await.unwrap();

        let task = store.task(id);
        assert_eq!(task.status, TaskStatus::Timeout);
        assert_eq!(worker.admission.status().submitted, 0);

        // TIMEOUT is not retry-eligible
        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Timeout);
        assert_eq!(store.task(id).retry_count, 0);
    }

    #[tokio::test]
    async fn test_poll_errors_do_not_fail_the_task() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);

        provider.push_submit(Ok(crate::provider::Submission::new("abc", ProviderStatus::Queued)));
        provider.push_poll(Err(ProviderError::InvalidResponse("garbled".to_string())));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![crate::provider::ProviderOutput::new("http://x/img.jpg")]));

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());

        worker.run_iteration().await.unwrap();
        // Poll failed transiently, task still SUBMITTED
        assert_eq!(store.task(id).status, TaskStatus::Submitted);

        worker.run_iteration().await.unwrap();
        assert_eq!(store.task(id).status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_post_processing_failure_marks_failed() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let id = new_task(&store);

        provider.push_submit(Ok(crate::provider::Submission::new("abc", ProviderStatus::Queued)));
        provider.push_poll(Ok(ProviderStatus::Success));
        provider.push_outputs(Ok(vec![])); // empty listing

        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), test_config());
        worker.submit_pass().await.unwrap();
        worker.poll_pass().await.unwrap();

        let task = store.task(id);
        assert_eq!(task.status, TaskStatus::Failed);
        let message = task.error_message.unwrap();
        // Distinguishable from provider-side failures, root cause kept
        assert!(message.starts_with("post-processing failed:"), "{message}");
        assert!(message.contains("no output"));
        assert_eq!(worker.admission.status().submitted, 0);
    }

    #[tokio::test]
    async fn test_submit_pass_defers_when_admission_full() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        for _ in 0..4 {
            new_task(&store);
        }
        for i in 0..4 {
            provider.push_submit(Ok(crate::provider::Submission::new(
                format!("task-{i}"),
                ProviderStatus::Queued,
            )));
            provider.push_poll(Ok(ProviderStatus::Running));
        }

        let mut config = test_config();
        config.admission.max_concurrent = 3;
        let (mut worker, _tx) = worker_with(Arc::clone(&store), Arc::clone(&provider), config);

        worker.run_iteration().await.unwrap();
        // Only three submissions fit through the admission gate
        assert_eq!(provider.submit_calls(), 3);
        assert_eq!(store.pending_tasks(10).unwrap().len(), 1);
        assert_eq!(worker.admission.status().submitted, 3);
    }

    #[test]
    fn test_storage_key_layout() {
        let store = MemoryTaskStore::default();
        let id = {
            let mut new = NewTask::new(EntityType::Prop, 3, "an ornate dagger");
            new.drama_name = Some("demo-drama".to_string());
            new.episode_number = Some(2);
            new.entity_name = Some("dagger".to_string());
            store.create_task(&new).unwrap()
        };
        let task = store.task(id);
        assert_eq!(storage_key(&task), "demo-drama/2/props/dagger.jpg");

        let bare = store.task(store.create_task(&NewTask::new(EntityType::Scene, 9, "x")).unwrap());
        assert_eq!(storage_key(&bare), "unsorted/0/scenes/entity-9.jpg");
    }

    #[test]
    fn test_error_backoff_growth_and_cap() {
        let interval = Duration::from_secs(20);
        let cap = Duration::from_secs(30);
        assert_eq!(error_backoff(interval, 1, cap), Duration::from_secs(20));
        assert_eq!(error_backoff(interval, 2, cap), Duration::from_secs(30));
        assert_eq!(error_backoff(interval, 10, cap), Duration::from_secs(30));
        assert_eq!(error_backoff(interval, 0, cap), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let store = Arc::new(MemoryTaskStore::default());
        let provider = Arc::new(MockProvider::new());
        let (mut worker, tx) = worker_with(store, provider, test_config());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .unwrap()
            .unwrap();
    }
}
