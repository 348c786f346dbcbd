//! gendaemon - background worker for asynchronous image-generation tasks
//!
//! Drives PENDING generation tasks through an external provider's
//! submit/poll/fetch protocol and persists the results: a single-threaded
//! worker loop reconciles task-store state with provider state every
//! iteration, an admission controller caps in-flight requests so the
//! provider's own queue limit is never hit, and successful outputs are
//! re-uploaded to durable object storage before the owning entity record
//! is updated.
//!
//! # Modules
//!
//! - [`admission`] - In-process concurrency gate with RAII slot guards
//! - [`retry`] - Exponential backoff policy shared by submission and polling
//! - [`provider`] - Generation provider protocol and RunningHub client
//! - [`storage`] - Object storage collaborator
//! - [`worker`] - The four-pass worker loop and task state machine
//! - [`config`] - YAML configuration with a fallback chain
//! - [`cli`] - Command-line interface

pub mod admission;
pub mod cli;
pub mod config;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod worker;

pub use admission::{AdmissionController, AdmissionStatus, SlotGuard};
pub use config::Config;
pub use provider::{
    GenerateError, GenerationParams, GenerationProvider, Generator, GeneratorOptions, ProviderError, ProviderStatus,
    RunningHubClient,
};
pub use retry::RetryPolicy;
pub use storage::{HttpObjectStorage, ObjectStorage, StorageError};
pub use worker::{ComponentFactory, Components, Worker};
