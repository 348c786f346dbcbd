//! Task record and status/type enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a generation task
///
/// PENDING is the only initial state. SUCCESS and TIMEOUT are terminal.
/// FAILED is quasi-terminal: the retry sweep may reset it to PENDING
/// while `retry_count < max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Submitted,
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Submitted => "SUBMITTED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }

    /// Submitted to the provider but not yet terminal
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Queued | TaskStatus::Running)
    }

    /// SUCCESS and TIMEOUT never transition again; FAILED only via the
    /// retry sweep
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "SUBMITTED" => Ok(TaskStatus::Submitted),
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            "TIMEOUT" => Ok(TaskStatus::Timeout),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which downstream entity kind this task renders for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CharacterImage,
    SceneImage,
    PropImage,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CharacterImage => "character_image",
            TaskType::SceneImage => "scene_image",
            TaskType::PropImage => "prop_image",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "character_image" => Ok(TaskType::CharacterImage),
            "scene_image" => Ok(TaskType::SceneImage),
            "prop_image" => Ok(TaskType::PropImage),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Owning domain entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Character,
    Scene,
    Prop,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::Scene => "scene",
            EntityType::Prop => "prop",
        }
    }

    /// Table holding the owning entity row
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Character => "character_portraits",
            EntityType::Scene => "scene_definitions",
            EntityType::Prop => "key_prop_definitions",
        }
    }

    /// Path segment used when building storage keys
    pub fn storage_segment(&self) -> &'static str {
        match self {
            EntityType::Character => "characters",
            EntityType::Scene => "scenes",
            EntityType::Prop => "props",
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            EntityType::Character => TaskType::CharacterImage,
            EntityType::Scene => TaskType::SceneImage,
            EntityType::Prop => TaskType::PropImage,
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "character" => Ok(EntityType::Character),
            "scene" => Ok(EntityType::Scene),
            "prop" => Ok(EntityType::Prop),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// A generation task row
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub task_type: TaskType,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub prompt: String,
    pub drama_name: Option<String>,
    pub episode_number: Option<i64>,
    pub entity_name: Option<String>,
    pub status: TaskStatus,
    /// External provider's task handle; None until SUBMITTED
    pub provider_task_id: Option<String>,
    pub result_url: Option<String>,
    pub storage_key: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// Fields required to create a new PENDING task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub prompt: String,
    pub drama_name: Option<String>,
    pub episode_number: Option<i64>,
    pub entity_name: Option<String>,
    pub max_retries: i64,
}

impl NewTask {
    pub fn new(entity_type: EntityType, entity_id: i64, prompt: impl Into<String>) -> Self {
        Self {
            task_type: entity_type.task_type(),
            entity_type,
            entity_id,
            prompt: prompt.into(),
            drama_name: None,
            episode_number: None,
            entity_name: None,
            max_retries: 3,
        }
    }
}

/// Partial update applied to a task row
///
/// Only the provided fields are written. The store derives lifecycle
/// timestamps from the status: SUBMITTED sets `submitted_at`, terminal
/// statuses set `completed_at`, QUEUED/RUNNING refresh `last_poll_at`.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the handle (used by the retry reset)
    pub provider_task_id: Option<Option<String>>,
    pub result_url: Option<String>,
    pub storage_key: Option<String>,
    /// `Some(None)` clears the message (used by the retry reset)
    pub error_message: Option<Option<String>>,
    pub increment_retry: bool,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Timeout),
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn submitted(provider_task_id: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Submitted),
            provider_task_id: Some(Some(provider_task_id.into())),
            ..Default::default()
        }
    }

    pub fn success(result_url: impl Into<String>, storage_key: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            result_url: Some(result_url.into()),
            storage_key: Some(storage_key.into()),
            ..Default::default()
        }
    }

    /// Reset used by the retry sweep: back to PENDING, handle and error
    /// cleared, retry budget consumed by one
    pub fn retry_reset() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            provider_task_id: Some(None),
            error_message: Some(None),
            increment_retry: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.provider_task_id.is_none()
            && self.result_url.is_none()
            && self.storage_key.is_none()
            && self.error_message.is_none()
            && !self.increment_retry
    }
}
