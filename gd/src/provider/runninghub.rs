//! RunningHub API client implementation
//!
//! Implements the GenerationProvider trait against RunningHub's webapp
//! endpoints. Every response arrives in a `{code, msg, data}` envelope;
//! `code == 0` is success and the shape of `data` varies per endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::types::{GenerationParams, ProviderOutput, ProviderStatus, Submission};
use super::{GenerationProvider, ProviderError};
use crate::config::ProviderConfig;

/// Marker RunningHub puts in `msg` when its own queue is at capacity
const QUEUE_FULL_MARKER: &str = "TASK_QUEUE_MAXED";

/// RunningHub webapp API client
pub struct RunningHubClient {
    api_key: String,
    base_url: String,
    webapp_id: String,
    prompt_node_id: String,
    ratio_node_id: String,
    http: Client,
}

impl RunningHubClient {
    /// Create a new client from configuration
    ///
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        debug!(?config.base_url, "from_config: called");
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ProviderError::InvalidResponse(format!(
                "API key not found in environment variable {}",
                config.api_key_env
            ))
        })?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            webapp_id: config.webapp_id.clone(),
            prompt_node_id: config.prompt_node_id.clone(),
            ratio_node_id: config.ratio_node_id.clone(),
            http,
        })
    }

    /// Build the nodeInfoList submission body
    fn build_submit_body(&self, prompt: &str, params: &GenerationParams) -> Value {
        debug!(prompt_len = prompt.len(), "build_submit_body: called");
        serde_json::json!({
            "webappId": self.webapp_id,
            "apiKey": self.api_key,
            "nodeInfoList": [
                {
                    "nodeId": self.prompt_node_id,
                    "fieldName": "text",
                    "fieldValue": prompt,
                },
                {
                    "nodeId": self.ratio_node_id,
                    "fieldName": "value",
                    "fieldValue": params.aspect_ratio_preset(),
                },
            ],
        })
    }

    fn task_body(&self, provider_task_id: &str) -> Value {
        serde_json::json!({
            "apiKey": self.api_key,
            "taskId": provider_task_id,
        })
    }

    /// POST a JSON body and unwrap the `{code, msg, data}` envelope
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "post: called");

        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "post: HTTP error");
            return Err(ProviderError::Api {
                code: status.as_u16() as i64,
                message: text,
            });
        }

        let envelope: ApiEnvelope = response.json().await?;
        unwrap_envelope(envelope)
    }
}

#[async_trait]
impl GenerationProvider for RunningHubClient {
    async fn submit(&self, prompt: &str, params: &GenerationParams) -> Result<Submission, ProviderError> {
        debug!("submit: called");
        let body = self.build_submit_body(prompt, params);
        let data = self.post("/task/openapi/ai-app/run", &body).await?;
        parse_submit_data(&data)
    }

    async fn poll_status(&self, provider_task_id: &str) -> Result<ProviderStatus, ProviderError> {
        debug!(%provider_task_id, "poll_status: called");
        let body = self.task_body(provider_task_id);
        let data = self.post("/task/openapi/status", &body).await?;
        parse_status_data(&data)
    }

    async fn fetch_outputs(&self, provider_task_id: &str) -> Result<Vec<ProviderOutput>, ProviderError> {
        debug!(%provider_task_id, "fetch_outputs: called");
        let body = self.task_body(provider_task_id);
        let data = self.post("/task/openapi/outputs", &body).await?;
        parse_outputs_data(&data)
    }
}

// RunningHub response envelope and payload shapes

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct OutputEntry {
    #[serde(rename = "fileUrl")]
    file_url: String,
    #[serde(rename = "fileType")]
    file_type: Option<String>,
    #[serde(rename = "nodeId")]
    node_id: Option<Value>,
}

/// Check the application-level `code`, classifying queue-full rejections
fn unwrap_envelope(envelope: ApiEnvelope) -> Result<Value, ProviderError> {
    if envelope.code == 0 {
        return Ok(envelope.data);
    }
    if envelope.msg.contains(QUEUE_FULL_MARKER) {
        debug!("unwrap_envelope: provider queue full");
        return Err(ProviderError::QueueFull(envelope.msg));
    }
    Err(ProviderError::Api {
        code: envelope.code,
        message: envelope.msg,
    })
}

/// Extract the task handle and initial status from a submission payload
///
/// `taskStatus` is not always present at submit time; a missing status
/// means the task was accepted into the provider queue.
fn parse_submit_data(data: &Value) -> Result<Submission, ProviderError> {
    let task_id = data
        .get("taskId")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::InvalidResponse(format!("submission data missing taskId: {data}")))?;

    let status = match data.get("taskStatus").and_then(Value::as_str) {
        Some(s) => s
            .parse::<ProviderStatus>()
            .map_err(ProviderError::InvalidResponse)?,
        None => ProviderStatus::Queued,
    };

    Ok(Submission::new(task_id, status))
}

/// Extract the task status from a status payload
///
/// Two formats are in the wild: `data` as a bare status string, and
/// `data` as an object carrying `taskStatus`.
fn parse_status_data(data: &Value) -> Result<ProviderStatus, ProviderError> {
    let raw = if let Some(s) = data.as_str() {
        s
    } else if let Some(s) = data.get("taskStatus").and_then(Value::as_str) {
        s
    } else {
        return Err(ProviderError::InvalidResponse(format!(
            "status data has unexpected shape: {data}"
        )));
    };

    raw.parse::<ProviderStatus>()
        .map_err(ProviderError::InvalidResponse)
}

/// Extract the output listing from an outputs payload
fn parse_outputs_data(data: &Value) -> Result<Vec<ProviderOutput>, ProviderError> {
    let entries: Vec<OutputEntry> = serde_json::from_value(data.clone())
        .map_err(|e| ProviderError::InvalidResponse(format!("outputs data is not a listing: {e}")))?;

    Ok(entries
        .into_iter()
        .map(|entry| ProviderOutput {
            url: entry.file_url,
            file_type: entry.file_type,
            // nodeId arrives as either a number or a string
            node_id: entry.node_id.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        })
        .collect())
}
