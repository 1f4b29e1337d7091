//! OpenAI streaming → Anthropic streaming translation
//!
//! The translator is an explicit state machine over upstream
//! `chat.completion.chunk` objects, emitting [`StreamEvent`]s in the order
//! Anthropic clients require:
//!
//! ```text
//! message_start
//!   content_block_start{i}
//!   content_block_delta{i} ...
//!   content_block_stop{i}
//! message_delta            (exactly once: stop_reason + usage)
//! message_stop
//! ```
//!
//! Text occupies block index 0; upstream `tool_calls[j]` maps to block index
//! `j + 1`. Three behaviors are structurally impossible here because clients
//! are known to break on them: a second `message_start`, a `message_delta`
//! before the stream ends, and a delta for a block that is not open.

use crate::translation::events::{
    ContentBlock, ContentDelta, MessageDeltaPayload, MessageStartPayload, StreamEvent, Usage,
};
use crate::translation::map_finish_reason;
use serde::Deserialize;
use std::collections::BTreeMap;

// ============================================================================
// Upstream Chunk Types
// ============================================================================

/// One upstream `chat.completion.chunk` payload.
///
/// Fields are lenient: OpenAI-compatible servers disagree on which metadata
/// they include.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

// ============================================================================
// Stream Translator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse,
}

#[derive(Debug)]
struct ActiveToolCall {
    id: String,
    #[allow(dead_code)]
    name: String,
    args_buf: String,
}

/// Per-response state machine translating upstream chunks into Anthropic
/// stream events. One instance per response, owned by the request task.
#[derive(Debug)]
pub struct StreamTranslator {
    /// Model id echoed in `message_start` (the client's original name).
    model: String,
    first_chunk_seen: bool,
    emitted_message_start: bool,
    /// Blocks currently open, by Anthropic block index.
    open_blocks: BTreeMap<u32, BlockKind>,
    /// Tool calls observed, by upstream tool_call index.
    active_tool_calls: BTreeMap<u32, ActiveToolCall>,
    /// The text block is only ever opened once.
    text_block_started: bool,
    tool_use_emitted: bool,
    emitted_message_delta: bool,
    emitted_message_stop: bool,
    usage: Option<(u32, u32)>,
    message_id: Option<String>,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            first_chunk_seen: false,
            emitted_message_start: false,
            open_blocks: BTreeMap::new(),
            active_tool_calls: BTreeMap::new(),
            text_block_started: false,
            tool_use_emitted: false,
            emitted_message_delta: false,
            emitted_message_stop: false,
            usage: None,
            message_id: None,
        }
    }

    /// True once the first downstream event has been produced.
    pub fn started(&self) -> bool {
        self.emitted_message_start
    }

    /// Consume one upstream chunk, producing zero or more downstream events.
    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.first_chunk_seen = true;

        if let Some(usage) = &chunk.usage {
            self.usage = Some((usage.prompt_tokens, usage.completion_tokens));
        }
        if self.message_id.is_none() {
            if let Some(id) = &chunk.id {
                self.message_id = Some(format!("msg_{}", id.replace("chatcmpl-", "")));
            }
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;
            let has_signal =
                delta.role.is_some() || delta.content.is_some() || delta.tool_calls.is_some();
            if has_signal && !self.emitted_message_start {
                out.push(self.message_start());
            }

            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    out.extend(self.text_delta(content));
                }
            }

            if let Some(tool_calls) = &delta.tool_calls {
                for tc in tool_calls {
                    out.extend(self.tool_call_delta(tc));
                }
            }

            if let Some(finish) = &choice.finish_reason {
                out.extend(self.close_all_and_delta(Some(finish)));
            }
        }

        out
    }

    /// Handle the upstream `[DONE]` sentinel.
    ///
    /// Guarantees the downstream envelope is complete even when upstream never
    /// sent a finish_reason (or never sent anything at all).
    pub fn on_done(&mut self) -> Vec<StreamEvent> {
        if !self.first_chunk_seen {
            tracing::debug!("upstream stream terminated without producing any chunks");
        }
        let mut out = Vec::new();
        if !self.emitted_message_start {
            out.push(self.message_start());
        }
        if !self.emitted_message_delta {
            out.extend(self.close_all_and_delta(None));
        }
        if !self.emitted_message_stop {
            self.emitted_message_stop = true;
            out.push(StreamEvent::MessageStop);
        }
        out
    }

    /// Terminate after a mid-stream upstream failure.
    ///
    /// Emits only the synthetic `message_stop` so the client observes a closed
    /// stream; anything else would claim a completion that never happened.
    pub fn finish_abrupt(&mut self) -> Vec<StreamEvent> {
        if self.emitted_message_start && !self.emitted_message_stop {
            self.emitted_message_stop = true;
            vec![StreamEvent::MessageStop]
        } else {
            Vec::new()
        }
    }

    fn message_start(&mut self) -> StreamEvent {
        self.emitted_message_start = true;
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| "msg_stream".to_string());
        StreamEvent::MessageStart {
            message: MessageStartPayload::new(id, self.model.clone()),
        }
    }

    fn text_delta(&mut self, content: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if !self.text_block_started {
            self.text_block_started = true;
            self.open_blocks.insert(0, BlockKind::Text);
            out.push(StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text {
                    text: String::new(),
                },
            });
        }
        if self.open_blocks.contains_key(&0) {
            out.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta {
                    text: content.to_string(),
                },
            });
        }
        out
    }

    fn tool_call_delta(&mut self, tc: &ToolCallDelta) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let j = tc.index;
        let block_index = j + 1;

        if !self.active_tool_calls.contains_key(&j) {
            let id = tc
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{:04x}", j));
            let name = tc
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();

            self.active_tool_calls.insert(
                j,
                ActiveToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    args_buf: String::new(),
                },
            );
            self.open_blocks.insert(block_index, BlockKind::ToolUse);
            self.tool_use_emitted = true;
            out.push(StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::json!({}),
                },
            });
        }

        if let Some(arguments) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
            if !arguments.is_empty() && self.open_blocks.contains_key(&block_index) {
                if let Some(active) = self.active_tool_calls.get_mut(&j) {
                    active.args_buf.push_str(arguments);
                }
                out.push(StreamEvent::ContentBlockDelta {
                    index: block_index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: arguments.clone(),
                    },
                });
            }
        }

        out
    }

    /// Close every open block in ascending index order, then emit the single
    /// `message_delta`.
    fn close_all_and_delta(&mut self, finish_reason: Option<&str>) -> Vec<StreamEvent> {
        if self.emitted_message_delta {
            return Vec::new();
        }
        self.emitted_message_delta = true;

        let mut out = Vec::new();
        if !self.emitted_message_start {
            out.push(self.message_start());
        }
        for index in std::mem::take(&mut self.open_blocks).into_keys() {
            out.push(StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = if self.tool_use_emitted {
            "tool_use".to_string()
        } else {
            finish_reason
                .map(map_finish_reason)
                .unwrap_or("end_turn")
                .to_string()
        };

        let (input_tokens, output_tokens) = self.usage.unwrap_or((0, 0));
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason,
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens,
                output_tokens,
            },
        });
        out
    }

    /// Unique ids of all tool-use blocks emitted so far.
    #[cfg(test)]
    fn tool_call_ids(&self) -> Vec<&str> {
        self.active_tool_calls
            .values()
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Concatenated argument fragments for the upstream tool index `j`.
    #[cfg(test)]
    fn tool_arguments(&self, j: u32) -> Option<&str> {
        self.active_tool_calls.get(&j).map(|t| t.args_buf.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(json: &str) -> ChatCompletionChunk {
        serde_json::from_str(json).unwrap()
    }

    fn run(upstream: &[&str]) -> (Vec<StreamEvent>, StreamTranslator) {
        let mut translator = StreamTranslator::new("claude-sonnet-4-20250514");
        let mut events = Vec::new();
        for data in upstream {
            if *data == "[DONE]" {
                events.extend(translator.on_done());
            } else {
                events.extend(translator.on_chunk(&chunk(data)));
            }
        }
        (events, translator)
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_name()).collect()
    }

    /// Every generated stream must satisfy the ordering invariants.
    fn assert_well_formed(events: &[StreamEvent]) {
        use std::collections::HashSet;

        assert_eq!(events[0].event_name(), "message_start");
        assert_eq!(events[events.len() - 1].event_name(), "message_stop");
        assert_eq!(
            events.iter().filter(|e| e.event_name() == "message_start").count(),
            1
        );
        assert_eq!(
            events.iter().filter(|e| e.event_name() == "message_stop").count(),
            1
        );
        assert_eq!(
            events.iter().filter(|e| e.event_name() == "message_delta").count(),
            1
        );

        let mut open: HashSet<u32> = HashSet::new();
        let mut ever_started: HashSet<u32> = HashSet::new();
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(ever_started.insert(*index), "block {} started twice", index);
                    open.insert(*index);
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert!(open.contains(index), "delta for closed/unopened {}", index);
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert!(open.remove(index), "stop without start {}", index);
                }
                StreamEvent::MessageStop => {
                    assert!(open.is_empty(), "message_stop with open blocks");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_basic_text_stream() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":" World"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_well_formed(&events);

        match &events[1] {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Text { text },
            } => {
                assert_eq!(*index, 0);
                assert!(text.is_empty());
            }
            other => panic!("expected text block start, got {:?}", other),
        }
        match (&events[2], &events[3]) {
            (
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::TextDelta { text: a },
                    ..
                },
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::TextDelta { text: b },
                    ..
                },
            ) => {
                assert_eq!(a, "Hello");
                assert_eq!(b, " World");
            }
            other => panic!("expected text deltas, got {:?}", other),
        }
        match &events[5] {
            StreamEvent::MessageDelta { delta, .. } => assert_eq!(delta.stop_reason, "end_turn"),
            other => panic!("expected message_delta, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_across_chunks() {
        let (events, translator) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"location\": \"Paris\""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        assert_well_formed(&events);
        assert_eq!(translator.tool_arguments(0), Some(r#"{"location": "Paris"}"#));

        let partials: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(partials, r#"{"location": "Paris"}"#);

        match events
            .iter()
            .find(|e| matches!(e, StreamEvent::ContentBlockStart { index: 1, .. }))
        {
            Some(StreamEvent::ContentBlockStart {
                content_block: ContentBlock::ToolUse { id, name, .. },
                ..
            }) => {
                assert_eq!(id, "call_abc");
                assert_eq!(name, "get_weather");
            }
            other => panic!("expected tool_use start at index 1, got {:?}", other),
        }

        match events.iter().find(|e| matches!(e, StreamEvent::MessageDelta { .. })) {
            Some(StreamEvent::MessageDelta { delta, .. }) => {
                assert_eq!(delta.stop_reason, "tool_use")
            }
            other => panic!("expected message_delta, got {:?}", other),
        }
    }

    #[test]
    fn test_text_then_tool_blocks_close_in_order() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"Checking"}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        assert_well_formed(&events);
        let stops: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![0, 1]);
    }

    #[test]
    fn test_done_without_finish_reason_completes_envelope() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"Hi"}}]}"#,
            "[DONE]",
        ]);

        assert_well_formed(&events);
        match events.iter().find(|e| matches!(e, StreamEvent::MessageDelta { .. })) {
            Some(StreamEvent::MessageDelta { delta, .. }) => {
                assert_eq!(delta.stop_reason, "end_turn")
            }
            other => panic!("expected message_delta, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_upstream_still_produces_well_formed_stream() {
        let (events, _) = run(&["[DONE]"]);
        assert_well_formed(&events);
    }

    #[test]
    fn test_finish_only_stream_still_opens_envelope() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        assert_well_formed(&events);
    }

    #[test]
    fn test_empty_content_does_not_open_block() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            "[DONE]",
        ]);

        assert!(names(&events).iter().all(|n| *n != "content_block_start"));
        assert_well_formed(&events);
    }

    #[test]
    fn test_no_second_message_start() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"role":"assistant","content":"x"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);

        assert_eq!(
            events.iter().filter(|e| e.event_name() == "message_start").count(),
            1
        );
        assert_well_formed(&events);
    }

    #[test]
    fn test_usage_carried_into_message_delta() {
        let (events, _) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"x"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":11,"completion_tokens":4}}"#,
            "[DONE]",
        ]);

        match events.iter().find(|e| matches!(e, StreamEvent::MessageDelta { .. })) {
            Some(StreamEvent::MessageDelta { usage, .. }) => {
                assert_eq!(usage.input_tokens, 11);
                assert_eq!(usage.output_tokens, 4);
            }
            other => panic!("expected message_delta, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_ids_unique_when_upstream_omits_ids() {
        let (events, translator) = run(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"a","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"name":"b","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        assert_well_formed(&events);
        let ids = translator.tool_call_ids();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_abrupt_finish_emits_only_message_stop() {
        let mut translator = StreamTranslator::new("m");
        let events =
            translator.on_chunk(&chunk(r#"{"choices":[{"delta":{"role":"assistant","content":"x"}}]}"#));
        assert!(!events.is_empty());

        let tail = translator.finish_abrupt();
        assert_eq!(names(&tail), vec!["message_stop"]);
        assert!(translator.finish_abrupt().is_empty());
    }

    #[test]
    fn test_abrupt_finish_before_start_emits_nothing() {
        let mut translator = StreamTranslator::new("m");
        assert!(translator.finish_abrupt().is_empty());
    }
}
