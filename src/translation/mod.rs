//! Protocol translation between the Anthropic Messages API and the
//! OpenAI-compatible surface the backend speaks
//!
//! ```text
//! Anthropic client request
//!     ↓ request::translate_request        (Messages → Chat Completions)
//! [backend]
//!     ↓ response::translate_response      (non-streaming)
//!     ↓ stream::StreamTranslator          (chunk events, streaming)
//! Anthropic client response
//! ```
//!
//! OpenAI-shaped clients bypass this module entirely; their traffic only
//! passes through the stream rewriter.

pub mod events;
pub mod request;
pub mod response;
pub mod stream;

/// Which API shape a client speaks, decided from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientFlavor {
    /// Anthropic Messages API (`/v1/messages*`)
    Anthropic,
    /// OpenAI Chat Completions API (everything else under `/v1`)
    OpenAi,
}

impl ClientFlavor {
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/v1/messages") {
            ClientFlavor::Anthropic
        } else {
            ClientFlavor::OpenAi
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientFlavor::Anthropic => "anthropic",
            ClientFlavor::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for ClientFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Map an OpenAI `finish_reason` to an Anthropic `stop_reason`.
pub fn map_finish_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "function_call" => "tool_use",
        _ => "end_turn",
    }
}
