//! Stream rewriter - per-response filter over upstream SSE bytes
//!
//! Sits between the backend's `chat.completion.chunk` stream and the client.
//! Three jobs, all on the live stream:
//!
//! 1. **XML salvage**: when model output carries textual tool syntax
//!    (`<function=`, `<tool_call`, `<function_call`), buffer the affected
//!    content, run the tool-call parser once a closing tag arrives, and splice
//!    the result back as a synthetic `tool_calls` chunk. Failure or truncation
//!    flushes the buffered text verbatim.
//! 2. **Duplicate suppression**: once any tool_calls chunk has been seen,
//!    suppress exact-duplicate chunks, bit-identical argument fragments per
//!    tool-call index, and repeated start events. Streams with no tool calls
//!    pass through byte-for-byte.
//! 3. **Protocol translation**: for Anthropic clients, feed the effective
//!    chunk sequence through the stream translator and emit Anthropic frames.
//!
//! The rewriter is line-oriented (`data: <json>` plus the `[DONE]` sentinel,
//! blank separators preserved) and never batches: every upstream line yields
//! its downstream bytes synchronously.

use crate::parser::{self, ToolCall};
use crate::translation::events::StreamEvent;
use crate::translation::stream::{ChatCompletionChunk, StreamTranslator};
use crate::translation::ClientFlavor;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

type Hash = [u8; 32];

fn hash_bytes(bytes: &[u8]) -> Hash {
    Sha256::digest(bytes).into()
}

/// Salvage phases. `Holdback` covers an opener split across chunk boundaries:
/// the accumulated text ends with a partial opener and the verdict is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SalvagePhase {
    Scanning,
    Holdback,
    Salvaging,
}

/// What happened to the previous data line, deciding the fate of the blank
/// separator that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastLine {
    None,
    Forwarded,
    Buffered,
    Suppressed,
    /// Emitted in rewritten form, framing already included.
    Rewritten,
}

#[derive(Debug)]
struct BufferedChunk {
    raw: String,
    value: Value,
}

/// An effective chunk after salvage resolution, before dedup.
enum Pending {
    Original { raw: String, value: Value },
    Synthetic(Value),
}

/// Per-response rewriter state. Owned exclusively by the request task.
pub struct StreamRewriter {
    flavor: ClientFlavor,
    translator: Option<StreamTranslator>,

    line_buf: String,
    last_line: LastLine,

    phase: SalvagePhase,
    accumulated_text: String,
    buffered: Vec<BufferedChunk>,

    tool_calls_detected: bool,
    seen_chunk_hashes: HashSet<Hash>,
    seen_arg_fragments: HashMap<u32, HashSet<Hash>>,
    started_tool_indexes: HashMap<u32, String>,

    bytes_filtered: u64,
    parse_failure_logged: bool,
}

impl StreamRewriter {
    /// Build a rewriter for one response. `client_model` is echoed in
    /// `message_start` on the Anthropic path and unused otherwise.
    pub fn new(flavor: ClientFlavor, client_model: &str) -> Self {
        let translator = match flavor {
            ClientFlavor::Anthropic => Some(StreamTranslator::new(client_model)),
            ClientFlavor::OpenAi => None,
        };
        Self {
            flavor,
            translator,
            line_buf: String::new(),
            last_line: LastLine::None,
            phase: SalvagePhase::Scanning,
            accumulated_text: String::new(),
            buffered: Vec::new(),
            tool_calls_detected: false,
            seen_chunk_hashes: HashSet::new(),
            seen_arg_fragments: HashMap::new(),
            started_tool_indexes: HashMap::new(),
            bytes_filtered: 0,
            parse_failure_logged: false,
        }
    }

    /// Total bytes suppressed so far (dedup and salvage).
    pub fn bytes_filtered(&self) -> u64 {
        self.bytes_filtered
    }

    /// Consume upstream bytes, producing the downstream bytes they resolve to.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.line_buf.push_str(&String::from_utf8_lossy(bytes));

        let mut out = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            out.extend(self.process_line(line));
        }
        out
    }

    /// Upstream ended. Flushes unresolved salvage buffers; on the Anthropic
    /// path also closes the downstream envelope if upstream died mid-stream.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();

        let buffered = std::mem::take(&mut self.buffered);
        self.phase = SalvagePhase::Scanning;
        for chunk in buffered {
            out.extend(self.emit_pending(Pending::Original {
                raw: chunk.raw,
                value: chunk.value,
            }));
        }

        if let Some(translator) = &mut self.translator {
            for event in translator.finish_abrupt() {
                out.extend(event.to_sse());
            }
        }

        out
    }

    // ------------------------------------------------------------------
    // Line handling
    // ------------------------------------------------------------------

    fn process_line(&mut self, line: String) -> Vec<u8> {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            return self.process_blank(line);
        }

        let Some(payload) = trimmed.strip_prefix("data:").map(str::trim) else {
            // Comments and event: lines are not part of the chunk protocol.
            return match self.flavor {
                ClientFlavor::OpenAi => {
                    self.last_line = LastLine::Forwarded;
                    line.into_bytes()
                }
                ClientFlavor::Anthropic => {
                    // Keepalive comments become Anthropic pings once the
                    // message envelope is open.
                    let started = self
                        .translator
                        .as_ref()
                        .map(StreamTranslator::started)
                        .unwrap_or(false);
                    if trimmed.starts_with(':') && started {
                        self.last_line = LastLine::Rewritten;
                        StreamEvent::Ping.to_sse()
                    } else {
                        self.last_line = LastLine::Suppressed;
                        Vec::new()
                    }
                }
            };
        };

        if payload == "[DONE]" {
            return self.process_done();
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(value) => self.process_chunk(line, value),
            Err(err) => {
                self.log_parse_failure(&format!("unparseable upstream chunk: {}", err));
                match self.flavor {
                    // Fall back to the original bytes.
                    ClientFlavor::OpenAi => {
                        self.last_line = LastLine::Forwarded;
                        line.into_bytes()
                    }
                    ClientFlavor::Anthropic => {
                        self.last_line = LastLine::Suppressed;
                        self.bytes_filtered += line.len() as u64;
                        Vec::new()
                    }
                }
            }
        }
    }

    fn process_blank(&mut self, line: String) -> Vec<u8> {
        match (self.flavor, self.last_line) {
            (ClientFlavor::Anthropic, _) => Vec::new(),
            (_, LastLine::Buffered) => {
                if let Some(last) = self.buffered.last_mut() {
                    last.raw.push_str(&line);
                }
                Vec::new()
            }
            (_, LastLine::Suppressed) | (_, LastLine::Rewritten) => {
                self.last_line = LastLine::None;
                Vec::new()
            }
            _ => line.into_bytes(),
        }
    }

    fn process_done(&mut self) -> Vec<u8> {
        let mut out = self.resolve_salvage_verbatim();

        match self.flavor {
            ClientFlavor::OpenAi => {
                // The terminator frame carries its own blank separator.
                self.last_line = LastLine::Rewritten;
                out.extend(StreamEvent::Terminator.to_sse());
            }
            ClientFlavor::Anthropic => {
                self.last_line = LastLine::Rewritten;
                if let Some(translator) = &mut self.translator {
                    for event in translator.on_done() {
                        out.extend(event.to_sse());
                    }
                }
            }
        }
        out
    }

    fn process_chunk(&mut self, raw: String, value: Value) -> Vec<u8> {
        let pendings = self.salvage_step(raw, value);
        let mut out = Vec::new();
        for pending in pendings {
            out.extend(self.emit_pending(pending));
        }
        out
    }

    // ------------------------------------------------------------------
    // Salvage mode
    // ------------------------------------------------------------------

    fn salvage_step(&mut self, raw: String, value: Value) -> Vec<Pending> {
        if let Some(content) = delta_content(&value) {
            self.accumulated_text.push_str(content);
        }

        match self.phase {
            SalvagePhase::Scanning => {
                if parser::find_opener(&self.accumulated_text).is_some() {
                    self.phase = SalvagePhase::Salvaging;
                    self.buffer_chunk(raw, value);
                    self.try_close_salvage()
                } else if parser::partial_opener_suffix(&self.accumulated_text) > 0 {
                    self.phase = SalvagePhase::Holdback;
                    self.buffer_chunk(raw, value);
                    Vec::new()
                } else {
                    vec![Pending::Original { raw, value }]
                }
            }
            SalvagePhase::Holdback => {
                self.buffer_chunk(raw, value);
                if parser::find_opener(&self.accumulated_text).is_some() {
                    self.phase = SalvagePhase::Salvaging;
                    self.try_close_salvage()
                } else if parser::partial_opener_suffix(&self.accumulated_text) > 0 {
                    Vec::new()
                } else {
                    // False alarm: the angle bracket was ordinary text.
                    self.phase = SalvagePhase::Scanning;
                    self.drain_buffered_as_originals()
                }
            }
            SalvagePhase::Salvaging => {
                self.buffer_chunk(raw, value);
                self.try_close_salvage()
            }
        }
    }

    fn buffer_chunk(&mut self, raw: String, value: Value) {
        self.buffered.push(BufferedChunk { raw, value });
        self.last_line = LastLine::Buffered;
    }

    fn drain_buffered_as_originals(&mut self) -> Vec<Pending> {
        std::mem::take(&mut self.buffered)
            .into_iter()
            .map(|c| Pending::Original {
                raw: c.raw,
                value: c.value,
            })
            .collect()
    }

    /// If a closing tag has arrived, run the parser over the accumulated text
    /// and resolve the buffer one way or the other.
    fn try_close_salvage(&mut self) -> Vec<Pending> {
        if !parser::has_xml_tool_calls(&self.accumulated_text) {
            return Vec::new();
        }

        let calls = parser::parse_tool_calls(&self.accumulated_text);
        self.phase = SalvagePhase::Scanning;
        self.accumulated_text.clear();

        if calls.is_empty() {
            self.log_parse_failure("textual tool syntax did not parse, forwarding verbatim");
            return self.drain_buffered_as_originals();
        }

        let buffered = std::mem::take(&mut self.buffered);
        let mut out = Vec::new();
        let mut synthesized = false;

        for chunk in buffered {
            let mut value = chunk.value;
            let had_content = strip_delta_content(&mut value);

            if had_content && !synthesized {
                // The first content-bearing chunk becomes the carrier of the
                // synthetic tool_calls array.
                synthesized = true;
                set_delta_tool_calls(&mut value, &calls);
                self.bytes_filtered += chunk.raw.len() as u64;
                out.push(Pending::Synthetic(value));
            } else if chunk_still_meaningful(&value) {
                // Carries finish_reason or usage the client still needs.
                out.push(Pending::Synthetic(value));
            } else {
                self.bytes_filtered += chunk.raw.len() as u64;
            }
        }

        tracing::debug!(
            calls = calls.len(),
            "salvaged textual tool syntax into structured tool_calls"
        );
        out
    }

    /// Flush any buffered chunks untouched (parse failed or stream ended).
    fn resolve_salvage_verbatim(&mut self) -> Vec<u8> {
        if self.buffered.is_empty() {
            return Vec::new();
        }
        self.phase = SalvagePhase::Scanning;
        let pendings = self.drain_buffered_as_originals();
        let mut out = Vec::new();
        for pending in pendings {
            out.extend(self.emit_pending(pending));
        }
        out
    }

    // ------------------------------------------------------------------
    // Dedup and emission
    // ------------------------------------------------------------------

    fn emit_pending(&mut self, pending: Pending) -> Vec<u8> {
        let (raw, value, rewritten) = match pending {
            Pending::Original { raw, value } => (Some(raw), value, false),
            Pending::Synthetic(value) => (None, value, true),
        };

        if !self.tool_calls_detected {
            if chunk_has_tool_calls(&value) {
                self.tool_calls_detected = true;
            } else {
                // Content must stream unchanged until tool calls appear.
                return self.emit_chunk(raw, value, rewritten);
            }
        }

        // Exact-duplicate full chunk.
        let payload = raw
            .as_deref()
            .map(|r| r.trim().trim_start_matches("data:").trim().to_string())
            .unwrap_or_else(|| value.to_string());
        if !self.seen_chunk_hashes.insert(hash_bytes(payload.as_bytes())) {
            self.suppress(raw.as_deref(), &payload);
            return Vec::new();
        }

        match self.filter_tool_call_fragments(&value) {
            FragmentOutcome::Unchanged => self.emit_chunk(raw, value, rewritten),
            FragmentOutcome::AllDropped => {
                if chunk_still_meaningful_without_tool_calls(&value) {
                    let mut stripped = value;
                    remove_delta_tool_calls(&mut stripped);
                    self.emit_chunk(None, stripped, true)
                } else {
                    self.suppress(raw.as_deref(), &payload);
                    Vec::new()
                }
            }
            FragmentOutcome::Filtered(kept) => {
                let mut rewritten_value = value;
                replace_delta_tool_calls(&mut rewritten_value, kept);
                self.emit_chunk(None, rewritten_value, true)
            }
        }
    }

    fn suppress(&mut self, raw: Option<&str>, payload: &str) {
        let len = raw.map(str::len).unwrap_or(payload.len());
        self.bytes_filtered += len as u64;
        self.last_line = LastLine::Suppressed;
        tracing::trace!(bytes = len, "suppressed duplicate tool-call chunk");
    }

    fn filter_tool_call_fragments(&mut self, value: &Value) -> FragmentOutcome {
        let Some(fragments) = value
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        else {
            return FragmentOutcome::Unchanged;
        };

        let mut kept: Vec<Value> = Vec::new();
        let mut dropped = 0usize;

        for fragment in fragments {
            let index = fragment
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            let id = fragment
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());
            let arguments = fragment
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("");

            if arguments.is_empty() {
                if let Some(id) = id {
                    if self.started_tool_indexes.get(&index).map(String::as_str) == Some(id) {
                        dropped += 1;
                        continue;
                    }
                    self.started_tool_indexes.insert(index, id.to_string());
                }
                kept.push(fragment.clone());
            } else {
                let seen = self.seen_arg_fragments.entry(index).or_default();
                if !seen.insert(hash_bytes(arguments.as_bytes())) {
                    dropped += 1;
                    continue;
                }
                if let Some(id) = id {
                    self.started_tool_indexes
                        .entry(index)
                        .or_insert_with(|| id.to_string());
                }
                kept.push(fragment.clone());
            }
        }

        if dropped == 0 {
            FragmentOutcome::Unchanged
        } else if kept.is_empty() {
            FragmentOutcome::AllDropped
        } else {
            FragmentOutcome::Filtered(kept)
        }
    }

    fn emit_chunk(&mut self, raw: Option<String>, value: Value, rewritten: bool) -> Vec<u8> {
        match self.flavor {
            ClientFlavor::OpenAi => {
                if let (Some(raw), false) = (&raw, rewritten) {
                    self.last_line = LastLine::Forwarded;
                    return raw.clone().into_bytes();
                }
                self.last_line = LastLine::Rewritten;
                format!("data: {}\n\n", value).into_bytes()
            }
            ClientFlavor::Anthropic => {
                self.last_line = LastLine::Rewritten;
                let chunk: ChatCompletionChunk = match serde_json::from_value(value) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        self.log_parse_failure(&format!("chunk shape not recognized: {}", err));
                        return Vec::new();
                    }
                };
                let translator = self
                    .translator
                    .as_mut()
                    .expect("anthropic rewriter has a translator");
                let mut out = Vec::new();
                for event in translator.on_chunk(&chunk) {
                    out.extend(event.to_sse());
                }
                out
            }
        }
    }

    fn log_parse_failure(&mut self, message: &str) {
        if !self.parse_failure_logged {
            self.parse_failure_logged = true;
            tracing::warn!("{}", message);
        }
    }
}

enum FragmentOutcome {
    Unchanged,
    AllDropped,
    Filtered(Vec<Value>),
}

// ============================================================================
// Chunk Inspection Helpers
// ============================================================================

fn delta_content(value: &Value) -> Option<&str> {
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn chunk_has_tool_calls(value: &Value) -> bool {
    value
        .pointer("/choices/0/delta/tool_calls")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false)
}

fn strip_delta_content(value: &mut Value) -> bool {
    value
        .pointer_mut("/choices/0/delta")
        .and_then(Value::as_object_mut)
        .map(|delta| delta.remove("content").is_some())
        .unwrap_or(false)
}

fn remove_delta_tool_calls(value: &mut Value) {
    if let Some(delta) = value
        .pointer_mut("/choices/0/delta")
        .and_then(Value::as_object_mut)
    {
        delta.remove("tool_calls");
    }
}

fn replace_delta_tool_calls(value: &mut Value, kept: Vec<Value>) {
    if let Some(delta) = value
        .pointer_mut("/choices/0/delta")
        .and_then(Value::as_object_mut)
    {
        delta.insert("tool_calls".to_string(), Value::Array(kept));
    }
}

fn set_delta_tool_calls(value: &mut Value, calls: &[ToolCall]) {
    let fragments: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            json!({
                "index": i,
                "id": call.id,
                "type": call.kind.as_str(),
                "function": {
                    "name": call.name,
                    "arguments": call.arguments_json,
                }
            })
        })
        .collect();

    if let Some(delta) = value
        .pointer_mut("/choices/0/delta")
        .and_then(Value::as_object_mut)
    {
        delta.insert("tool_calls".to_string(), Value::Array(fragments));
    }
}

/// After content removal: does this chunk still carry anything a client needs?
fn chunk_still_meaningful(value: &Value) -> bool {
    let finish = value
        .pointer("/choices/0/finish_reason")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    let usage = value.get("usage").map(|v| !v.is_null()).unwrap_or(false);
    let delta_nonempty = value
        .pointer("/choices/0/delta")
        .and_then(Value::as_object)
        .map(|d| d.keys().any(|k| k != "content"))
        .unwrap_or(false);
    finish || usage || delta_nonempty
}

fn chunk_still_meaningful_without_tool_calls(value: &Value) -> bool {
    let finish = value
        .pointer("/choices/0/finish_reason")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    let usage = value.get("usage").map(|v| !v.is_null()).unwrap_or(false);
    let delta_nonempty = value
        .pointer("/choices/0/delta")
        .and_then(Value::as_object)
        .map(|d| d.keys().any(|k| k != "tool_calls"))
        .unwrap_or(false);
    finish || usage || delta_nonempty
}
