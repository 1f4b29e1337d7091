//! OpenAI non-streaming → Anthropic response translation
//!
//! Maps a complete `chat.completion` object to an Anthropic `message` object.
//! `finish_reason` translates through [`crate::translation::map_finish_reason`];
//! `usage.total_tokens` is dropped and missing usage stays missing rather than
//! being synthesized.

use crate::translation::map_finish_reason;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Translate a buffered OpenAI response body into an Anthropic message body.
///
/// `client_model` is the model id the client originally sent; it is echoed in
/// the response so clients see the name they asked for.
pub fn translate_response(body: &[u8], client_model: &str) -> Result<Vec<u8>> {
    let completion: OpenAiChatCompletion =
        serde_json::from_slice(body).context("failed to parse OpenAI response")?;

    let choice = completion.choices.first();

    let mut content: Vec<AnthropicContentBlock> = Vec::new();
    if let Some(choice) = choice {
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(AnthropicContentBlock::Text { text: text.clone() });
            }
        }

        if let Some(fc) = &choice.message.function_call {
            content.push(tool_use_block(
                format!("call_{:04x}", 0),
                fc.name.clone(),
                &fc.arguments,
            ));
        }

        // Some OpenAI-compatible servers emit the newer tool_calls array
        // instead of function_call.
        if let Some(tool_calls) = &choice.message.tool_calls {
            for tc in tool_calls {
                content.push(tool_use_block(
                    tc.id.clone(),
                    tc.function.name.clone(),
                    &tc.function.arguments,
                ));
            }
        }
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_finish_reason)
        .map(str::to_string);

    let usage = completion.usage.as_ref().map(|u| AnthropicUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    let message = AnthropicResponse {
        id: format!("msg_{}", completion.id.replace("chatcmpl-", "")),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: client_model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    };

    serde_json::to_vec(&message).context("failed to serialize Anthropic response")
}

fn tool_use_block(id: String, name: String, arguments: &str) -> AnthropicContentBlock {
    let input: serde_json::Value =
        serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}));
    AnthropicContentBlock::ToolUse { id, name, input }
}

// ============================================================================
// OpenAI Response Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletion {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    object: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    created: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    #[allow(dead_code)]
    index: u32,
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[allow(dead_code)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<OpenAiFunctionCall>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    // total_tokens has no Anthropic counterpart.
    #[serde(default)]
    #[allow(dead_code)]
    total_tokens: u32,
}

// ============================================================================
// Anthropic Response Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: String,
    role: String,
    content: Vec<AnthropicContentBlock>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
