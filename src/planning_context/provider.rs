//! The LLM provider contract (spec §6.1) and its test doubles.
//!
//! This module defines the trait boundary only — no concrete HTTP or
//! gRPC backend is implemented, matching the out-of-scope note on the
//! transport layer. Workers and the interactive agent depend on
//! `Provider` as a trait object resolved from the provider registry.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use forge_common::ErrorCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {message}")]
    RequestFailed { message: String, category: ErrorCategory },

    #[error("no provider bound for agent type {0}")]
    NoProviderBound(String),

    #[error("provider {0} not registered")]
    NotRegistered(String),
}

/// One block of a provider response: either prose, or a request to
/// invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { content: String },
    Assistant { content: Vec<ContentBlock> },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A chunk of a streamed response: either incremental text or the
/// terminal descriptor carrying the full content and stop reason.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done(ProviderResponse),
}

/// Pluggable LLM backend boundary (spec §6.1). Implementations own
/// their own transport, auth, and retry-with-backoff behavior; callers
/// only see the request/response shape below.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &SendOptions,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Default streaming implementation: collect the non-streaming
    /// response and replay it as a single chunk. Real backends override
    /// this with incremental delivery.
    async fn send_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &SendOptions,
    ) -> Result<Vec<StreamChunk>, ProviderError> {
        let response = self.send(messages, tools, options).await?;
        Ok(vec![StreamChunk::Done(response)])
    }
}

/// Always returns an empty `end_turn` response with no content. Useful
/// as a placeholder binding when no real provider is configured for an
/// agent type and the caller wants a predictable no-op rather than a
/// configuration error.
pub struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _options: &SendOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![],
            error_message: None,
        })
    }
}

/// Replays a pre-programmed sequence of responses, one per call to
/// `send`. Panics via an error return (not a panic) once the script is
/// exhausted, so tests see a clear failure instead of a silent default.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
        }
    }

    pub fn text_response(text: impl Into<String>) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::Text { text: text.into() }],
            error_message: None,
        })
    }

    pub fn tool_use_response(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![ContentBlock::ToolUse { id: id.into(), name: tool_name.into(), input }],
            error_message: None,
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _options: &SendOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut script = self.script.lock().expect("scripted provider lock poisoned");
        script.pop_front().unwrap_or_else(|| {
            Err(ProviderError::RequestFailed {
                message: format!("{} script exhausted", self.name),
                category: ErrorCategory::Permanent,
            })
        })
    }
}

/// Retry-aware wrapper applying the backoff schedule from spec §4.7
/// (60s/120s/300s/900s/1800s, max 5 retries) around any `Provider`.
/// Transient and unknown categories are retried; permanent failures
/// return immediately.
pub async fn send_with_retry(
    provider: &dyn Provider,
    messages: &[Message],
    tools: &[ToolSpec],
    options: &SendOptions,
) -> Result<ProviderResponse, ProviderError> {
    const BACKOFFS_SECS: [u64; 5] = [60, 120, 300, 900, 1800];

    let mut last_err = None;
    for (attempt, delay_secs) in std::iter::once(0).chain(BACKOFFS_SECS).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        }
        match provider.send(messages, tools, options).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                let retryable = matches!(
                    &err,
                    ProviderError::RequestFailed { category: ErrorCategory::Transient, .. }
                        | ProviderError::RequestFailed { category: ErrorCategory::Unknown, .. }
                );
                last_err = Some(err);
                if !retryable {
                    break;
                }
            }
        }
    }
    Err(last_err.expect("loop always runs at least once"))
}
