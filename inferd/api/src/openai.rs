// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The slice of the OpenAI chat-completion wire format the protocol needs:
//! enough of the request to estimate cost and route by model, and enough of
//! the response (streamed or unary) to extract usage counts and a canonical
//! body hash for the finish message.

use anyhow::{anyhow, Context};
use serde::Deserialize;

/// Applied when the request does not cap its completion.
pub const DEFAULT_MAX_TOKENS: u64 = 256;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatRequest {
    pub fn parse(body: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(body).context("invalid chat completion request")
    }

    /// The prompt as one text blob, the form the tokenize endpoint takes.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rough prompt size before the worker has tokenized anything: one
    /// token per four characters, never zero.
    pub fn prompt_tokens_estimate(&self) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        (chars as u64).div_ceil(4).max(1)
    }

    pub fn max_tokens_or_default(&self) -> u64 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Rewrite the request body with the deterministic seed the executor must
/// run under. Everything else is preserved as-is.
pub fn inject_seed(body: &[u8], seed: i32) -> anyhow::Result<Vec<u8>> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).context("invalid chat completion request")?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("request body must be a JSON object"))?;
    object.insert("seed".to_string(), serde_json::Value::from(seed));
    Ok(serde_json::to_vec(&value)?)
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct UnaryResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// What the executor needs out of a worker response.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedUpstream {
    pub model: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Base64 SHA-256 over the canonical payload: the raw body for unary
    /// responses, the concatenated event payloads for streams.
    pub hash: String,
    pub streamed: bool,
}

pub fn parse_upstream(content_type: Option<&str>, body: &[u8]) -> anyhow::Result<ParsedUpstream> {
    let looks_streamed = content_type
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or_else(|| body.starts_with(b"data:"));

    if looks_streamed {
        parse_stream(body)
    } else {
        parse_unary(body)
    }
}

fn parse_unary(body: &[u8]) -> anyhow::Result<ParsedUpstream> {
    let response: UnaryResponse =
        serde_json::from_slice(body).context("invalid chat completion response")?;
    let usage = response.usage.unwrap_or_default();
    Ok(ParsedUpstream {
        model: response.model,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        hash: inferd_crypto::to_b64(&inferd_crypto::sha256(body)),
        streamed: false,
    })
}

/// Walk the `data:` events of an SSE body. The final usage-bearing chunk
/// wins; the hash covers every event payload except the terminator.
fn parse_stream(body: &[u8]) -> anyhow::Result<ParsedUpstream> {
    let text = std::str::from_utf8(body).context("stream is not UTF-8")?;

    let mut model = None;
    let mut usage = Usage::default();
    let mut canonical = String::new();

    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }

        canonical.push_str(payload);
        canonical.push('\n');

        let Ok(chunk) = serde_json::from_str::<UnaryResponse>(payload) else {
            continue;
        };
        if model.is_none() {
            model = chunk.model;
        }
        if let Some(chunk_usage) = chunk.usage {
            usage = chunk_usage;
        }
    }

    if canonical.is_empty() {
        return Err(anyhow!("stream contained no events"));
    }

    Ok(ParsedUpstream {
        model,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        hash: inferd_crypto::to_b64(&inferd_crypto::sha256(canonical.as_bytes())),
        streamed: true,
    })
}
