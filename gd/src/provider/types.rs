//! Provider status vocabulary and request/response types

use serde::{Deserialize, Serialize};

/// Provider-side task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderStatus {
    Queued,
    Running,
    Success,
    Fail,
    Cancel,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Queued => "QUEUED",
            ProviderStatus::Running => "RUNNING",
            ProviderStatus::Success => "SUCCESS",
            ProviderStatus::Fail => "FAIL",
            ProviderStatus::Cancel => "CANCEL",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProviderStatus::Queued | ProviderStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::str::FromStr for ProviderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(ProviderStatus::Queued),
            "RUNNING" => Ok(ProviderStatus::Running),
            "SUCCESS" => Ok(ProviderStatus::Success),
            "FAIL" => Ok(ProviderStatus::Fail),
            "CANCEL" => Ok(ProviderStatus::Cancel),
            _ => Err(format!("Unknown provider status: {}", s)),
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted submission: the provider's handle plus the status it reported
/// at submit time (QUEUED or RUNNING expected)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub provider_task_id: String,
    pub status: ProviderStatus,
}

impl Submission {
    pub fn new(provider_task_id: impl Into<String>, status: ProviderStatus) -> Self {
        Self {
            provider_task_id: provider_task_id.into(),
            status,
        }
    }
}

/// One entry of a task's output listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutput {
    pub url: String,
    pub file_type: Option<String>,
    pub node_id: Option<String>,
}

impl ProviderOutput {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_type: None,
            node_id: None,
        }
    }
}

/// Generation parameters beyond the prompt
///
/// Width and height only decide the aspect-ratio preset, not exact pixel
/// dimensions; the provider picks the actual resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl GenerationParams {
    /// Preset value for the provider's ratio-selection node: portrait by
    /// default, landscape when wider than tall, square when equal
    pub fn aspect_ratio_preset(&self) -> &'static str {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > h => "0",
            (Some(w), Some(h)) if w == h => "1",
            _ => "5",
        }
    }
}
