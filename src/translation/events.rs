//! Anthropic stream events as a tagged variant type
//!
//! The stream translator produces values of [`StreamEvent`]; rendering to the
//! wire format lives here so ordering logic never touches serialization.
//! Frames follow the Messages API SSE shape:
//!
//! ```text
//! event: <event_type>
//! data: <json>
//!
//! ```

use serde::Serialize;

/// One event of an Anthropic-shaped response stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStartPayload,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaPayload,
        usage: Usage,
    },
    MessageStop,
    Ping,
    /// The upstream `data: [DONE]` sentinel. Never serialized as JSON.
    Terminator,
}

impl StreamEvent {
    /// The `event:` line value for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Terminator => "terminator",
        }
    }

    /// Render this event as a complete SSE frame.
    pub fn to_sse(&self) -> Vec<u8> {
        if let StreamEvent::Terminator = self {
            return b"data: [DONE]\n\n".to_vec();
        }
        let json = serde_json::to_string(self).expect("stream event serializes");
        format!("event: {}\ndata: {}\n\n", self.event_name(), json).into_bytes()
    }
}

/// The `message` object inside `message_start`.
///
/// `content` must serialize as the literal empty array and `usage` must be
/// present with numeric fields: several Anthropic SDK clients crash on `null`
/// content or missing usage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageStartPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<serde_json::Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl MessageStartPayload {
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            message_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model,
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageDeltaPayload {
    pub stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_start_has_empty_content_array_and_usage() {
        let event = StreamEvent::MessageStart {
            message: MessageStartPayload::new("msg_1".to_string(), "qwen".to_string()),
        };
        let frame = String::from_utf8(event.to_sse()).unwrap();

        assert!(frame.starts_with("event: message_start\ndata: "));
        let json: serde_json::Value =
            serde_json::from_str(frame.trim().strip_prefix("event: message_start\ndata: ").unwrap())
                .unwrap();
        assert_eq!(json["message"]["content"], serde_json::json!([]));
        assert_eq!(json["message"]["usage"]["input_tokens"], 0);
        assert_eq!(json["message"]["usage"]["output_tokens"], 0);
    }

    #[test]
    fn test_terminator_renders_done_sentinel() {
        assert_eq!(StreamEvent::Terminator.to_sse(), b"data: [DONE]\n\n");
    }

    #[test]
    fn test_content_delta_serialization() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "hi".to_string(),
            },
        };
        let frame = String::from_utf8(event.to_sse()).unwrap();
        assert!(frame.contains(r#""type":"text_delta""#));
        assert!(frame.contains(r#""text":"hi""#));
    }

    #[test]
    fn test_message_delta_omits_missing_stop_sequence() {
        let event = StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: "end_turn".to_string(),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: 3,
                output_tokens: 7,
            },
        };
        let frame = String::from_utf8(event.to_sse()).unwrap();
        assert!(!frame.contains("stop_sequence"));
        assert!(frame.contains(r#""output_tokens":7"#));
    }
}
