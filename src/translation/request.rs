//! Anthropic → OpenAI request translation
//!
//! Converts Anthropic Messages API requests into the Chat Completions shape
//! the backend accepts.
//!
//! # Key Differences
//!
//! | Anthropic                       | OpenAI                           |
//! |---------------------------------|----------------------------------|
//! | Top-level `system` field        | `messages[].role: "system"`      |
//! | `stop_sequences` (array)        | `stop` (array)                   |
//! | `tools[].input_schema`          | `functions[].parameters`         |
//! | `tool_choice` object            | `function_call` string/object    |
//! | content block arrays            | plain string content             |
//!
//! Non-text content blocks have no representation on the backend and are
//! dropped with a warning. `metadata` is recognized but never forwarded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Translate an Anthropic request body into an OpenAI request body.
///
/// `served_model` overrides the model the backend sees (the backend serves a
/// single model under a fixed name); the client's model id stays on the
/// fingerprint for response mapping.
pub fn translate_request(body: &[u8], served_model: Option<&str>) -> Result<TranslatedRequest> {
    let request: AnthropicRequest =
        serde_json::from_slice(body).context("failed to parse Anthropic request")?;

    let mut messages: Vec<OpenAiMessage> = Vec::new();

    if let Some(system) = &request.system {
        let system_text = match system {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    SystemBlock::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !system_text.is_empty() {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system_text,
            });
        }
    }

    for msg in &request.messages {
        messages.push(convert_message(msg));
    }

    let openai = OpenAiChatRequest {
        model: served_model
            .map(str::to_string)
            .unwrap_or_else(|| request.model.clone()),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        functions: request
            .tools
            .map(|tools| tools.into_iter().map(convert_tool).collect()),
        function_call: request.tool_choice.map(convert_tool_choice),
    };

    let body = serde_json::to_vec(&openai).context("failed to serialize OpenAI request")?;

    Ok(TranslatedRequest {
        body,
        model: request.model,
        streaming: request.stream.unwrap_or(false),
    })
}

/// Result of request translation: the rewritten body plus the fingerprint
/// fields the dispatcher needs for the response side.
#[derive(Debug)]
pub struct TranslatedRequest {
    pub body: Vec<u8>,
    /// Model id as the client sent it.
    pub model: String,
    pub streaming: bool,
}

// ============================================================================
// Anthropic Request Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    tool_choice: Option<AnthropicToolChoice>,
    // Recognized but never forwarded upstream.
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
}

// ============================================================================
// OpenAI Request Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<Vec<OpenAiFunction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<OpenAiFunctionChoice>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiFunctionChoice {
    Mode(String),
    Specific { name: String },
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Flatten one Anthropic message into a single plain-content message.
fn convert_message(msg: &AnthropicMessage) -> OpenAiMessage {
    let content = match &msg.content {
        AnthropicContent::Text(text) => text.clone(),
        AnthropicContent::Blocks(blocks) => {
            let mut texts: Vec<&str> = Vec::new();
            let mut dropped = 0usize;
            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => texts.push(text),
                    AnthropicContentBlock::Other => dropped += 1,
                }
            }
            if dropped > 0 {
                tracing::warn!(
                    role = %msg.role,
                    dropped,
                    "dropping non-text content blocks with no backend representation"
                );
            }
            texts.join("\n")
        }
    };

    OpenAiMessage {
        role: msg.role.clone(),
        content,
    }
}

fn convert_tool(tool: AnthropicTool) -> OpenAiFunction {
    OpenAiFunction {
        name: tool.name,
        description: tool.description,
        parameters: tool.input_schema,
    }
}

fn convert_tool_choice(choice: AnthropicToolChoice) -> OpenAiFunctionChoice {
    match choice {
        AnthropicToolChoice::Auto => OpenAiFunctionChoice::Mode("auto".to_string()),
        // The legacy function_call field has no "required" mode.
        AnthropicToolChoice::Any => OpenAiFunctionChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Tool { name } => OpenAiFunctionChoice::Specific { name },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_request_translation() {
        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "Hello"}
            ]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["model"], "claude-sonnet-4-20250514");
        assert_eq!(openai["messages"][0]["role"], "user");
        assert_eq!(openai["messages"][0]["content"], "Hello");
        assert_eq!(openai["max_tokens"], 1024);
        assert_eq!(translated.model, "claude-sonnet-4-20250514");
        assert!(!translated.streaming);
    }

    #[test]
    fn test_served_model_override() {
        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated =
            translate_request(anthropic_body.as_bytes(), Some("qwen3-32b")).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["model"], "qwen3-32b");
        assert_eq!(translated.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_system_prompt_becomes_message() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "Hello"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["messages"][0]["role"], "system");
        assert_eq!(openai["messages"][0]["content"], "You are helpful");
        assert_eq!(openai["messages"][1]["role"], "user");
    }

    #[test]
    fn test_content_blocks_join_with_newline() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "first"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "xx"}},
                    {"type": "text", "text": "second"}
                ]
            }]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["messages"][0]["content"], "first\nsecond");
    }

    #[test]
    fn test_stop_sequences_become_stop() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "stop_sequences": ["END", "STOP"],
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["stop"], serde_json::json!(["END", "STOP"]));
        assert!(openai.get("stop_sequences").is_none());
    }

    #[test]
    fn test_tools_become_functions() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "tools": [{
                "name": "get_weather",
                "description": "Weather lookup",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
            }],
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        let function = &openai["functions"][0];
        assert_eq!(function["name"], "get_weather");
        assert_eq!(function["description"], "Weather lookup");
        assert_eq!(function["parameters"]["type"], "object");
        assert!(openai.get("tools").is_none());
    }

    #[test]
    fn test_tool_choice_rewrites() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "tools": [{"name": "t", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "t"},
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert_eq!(openai["function_call"]["name"], "t");
    }

    #[test]
    fn test_metadata_not_forwarded() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "metadata": {"user_id": "u-123"},
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();

        assert!(openai.get("metadata").is_none());
    }

    #[test]
    fn test_streaming_flag() {
        let anthropic_body = r#"{
            "model": "m",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let translated = translate_request(anthropic_body.as_bytes(), None).unwrap();
        assert!(translated.streaming);

        let openai: serde_json::Value = serde_json::from_slice(&translated.body).unwrap();
        assert_eq!(openai["stream"], true);
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(translate_request(b"not json", None).is_err());
    }
}
