// Parser module - extracts structured tool calls from model text output
//
// Open-weight models behind an OpenAI-compatible server frequently emit tool
// invocations as pseudo-XML in the text channel instead of using the
// structured tool_calls field. This module recognizes the observed dialects
// and converts them into proper tool calls so the stream rewriter can splice
// them back into the response.
//
// Recognized dialects:
//
// 1. `<tool_call><tool_name>N</tool_name><tool_arguments>A</tool_arguments></tool_call>`
//    (inner argument tag may also be `arguments` or `args`)
// 2. `<function_call><name>N</name><arguments>A</arguments></function_call>`
// 3. Legacy `<function=NAME><parameter=KEY>VALUE...</tool_call>` where
//    parameters may lack closing tags
// 4. Either of the above with a `name="..."` attribute replacing the inner
//    name tag

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// A structured tool invocation recovered from model output.
///
/// `arguments_json` always holds a JSON serialization. Ids are ordinal within
/// one response (`call_0000`, `call_0001`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolCallKind,
    pub name: String,
    pub arguments_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallKind {
    Function,
}

impl ToolCallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallKind::Function => "function",
        }
    }
}

/// Openers that may introduce textual tool syntax.
pub const OPENERS: [&str; 3] = ["<function=", "<tool_call", "<function_call"];

/// Closers that terminate textual tool syntax.
pub const CLOSERS: [&str; 2] = ["</tool_call>", "</function_call>"];

/// Check whether `text` contains a complete textual tool-call candidate.
///
/// True iff a recognized opener and one of the closing tags are both present.
/// Used by the stream rewriter to decide when to hand accumulated text to
/// [`parse_tool_calls`].
pub fn has_xml_tool_calls(text: &str) -> bool {
    OPENERS.iter().any(|o| text.contains(o)) && CLOSERS.iter().any(|c| text.contains(c))
}

/// Byte offset of the earliest recognized opener in `text`, if any.
pub fn find_opener(text: &str) -> Option<usize> {
    OPENERS.iter().filter_map(|o| text.find(o)).min()
}

/// Longest suffix of `text` that is a proper prefix of some opener.
///
/// The stream rewriter uses this to hold back a chunk whose tail might be the
/// first half of an opener split across chunk boundaries.
pub fn partial_opener_suffix(text: &str) -> usize {
    let bytes = text.as_bytes();
    // An opener is at most 14 bytes, so only the tail needs scanning.
    let window = bytes.len().min(16);
    for start in bytes.len() - window..bytes.len() {
        if bytes[start] != b'<' {
            continue;
        }
        let tail = &text[start..];
        if OPENERS
            .iter()
            .any(|o| o.starts_with(tail) && tail.len() < o.len())
        {
            return tail.len();
        }
    }
    0
}

/// Parse all tool calls present in `text`, in document order.
///
/// Malformed or unrecognized input yields an empty vector, never an error:
/// the caller falls back to forwarding the original text.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let cleaned = preprocess(text);
    let raw = scan(&cleaned);

    raw.into_iter()
        .enumerate()
        .map(|(idx, call)| ToolCall {
            id: format!("call_{:04x}", idx),
            kind: ToolCallKind::Function,
            name: call.name,
            arguments_json: call.arguments_json,
        })
        .collect()
}

// ============================================================================
// Preprocessing
// ============================================================================

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*```[A-Za-z0-9_+-]*\s*$").expect("fence regex"))
}

fn xmlns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\s+xmlns(?::[A-Za-z0-9_-]+)?\s*=\s*"[^"]*""#).expect("xmlns regex")
    })
}

fn ns_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(/?)[A-Za-z0-9_-]+:").expect("ns prefix regex"))
}

/// Normalize raw model output before scanning.
///
/// Applied in order: BOM strip, markdown fence strip, outermost CDATA unwrap,
/// namespace declaration strip and prefix collapse (`ns:tag` becomes `tag`).
fn preprocess(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let text = fence_re().replace_all(text, "");

    let trimmed = text.trim();
    let text = match trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|t| t.strip_suffix("]]>"))
    {
        Some(inner) => inner.to_string(),
        None => text.into_owned(),
    };

    let text = xmlns_re().replace_all(&text, "");
    ns_prefix_re().replace_all(&text, "<$1").into_owned()
}

/// Unescape the HTML/XML entities that show up in model output.
fn unescape_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let Some(semi) = rest[..rest.len().min(10)].find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let replacement = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse::<u32>().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match replacement {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// ============================================================================
// Scanning
// ============================================================================

#[derive(Debug)]
struct RawCall {
    name: String,
    arguments_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Opener {
    ToolCall,
    FunctionCall,
    LegacyFunction,
}

impl Opener {
    fn tag(&self) -> &'static str {
        match self {
            Opener::ToolCall => "<tool_call",
            Opener::FunctionCall => "<function_call",
            Opener::LegacyFunction => "<function=",
        }
    }

    fn closer(&self) -> &'static str {
        match self {
            Opener::ToolCall => "</tool_call>",
            Opener::FunctionCall => "</function_call>",
            // Legacy output closes with </tool_call> in the wild.
            Opener::LegacyFunction => "</tool_call>",
        }
    }
}

/// Locate the earliest opener at or after `from`.
fn next_opener(text: &str, from: usize) -> Option<(usize, Opener)> {
    let mut best: Option<(usize, Opener)> = None;
    // function_call must be probed before the legacy form: both begin with
    // "<function".
    for opener in [
        Opener::ToolCall,
        Opener::FunctionCall,
        Opener::LegacyFunction,
    ] {
        let mut search = from;
        while let Some(rel) = text[search..].find(opener.tag()) {
            let pos = search + rel;
            if opener_is_plausible(text, pos, opener) {
                if best.map(|(b, _)| pos < b).unwrap_or(true) {
                    best = Some((pos, opener));
                }
                break;
            }
            search = pos + 1;
        }
    }
    best
}

/// Reject lookalike tags such as `<tool_calls>` or `<function_caller>`.
fn opener_is_plausible(text: &str, pos: usize, opener: Opener) -> bool {
    let after = pos + opener.tag().len();
    match opener {
        Opener::LegacyFunction => true,
        _ => match text.as_bytes().get(after) {
            None => true,
            Some(b'>') | Some(b'/') => true,
            Some(c) if c.is_ascii_whitespace() => true,
            _ => false,
        },
    }
}

fn scan(text: &str) -> Vec<RawCall> {
    let mut calls: Vec<RawCall> = Vec::new();
    // Fragment merge state: index into `calls` of the accumulating call plus
    // the concatenated argument payload.
    let mut fragment_slot: Option<(usize, String)> = None;

    let mut pos = 0;
    while let Some((start, opener)) = next_opener(text, pos) {
        match opener {
            Opener::LegacyFunction => {
                let (call, next) = parse_legacy(text, start);
                pos = next;
                if let Some(call) = call {
                    calls.push(call);
                }
            }
            Opener::ToolCall | Opener::FunctionCall => {
                let Some(parsed) = parse_tagged(text, start, opener) else {
                    pos = start + opener.tag().len();
                    continue;
                };
                pos = parsed.next;

                if parsed.is_fragment {
                    match &mut fragment_slot {
                        Some((idx, payload)) => {
                            payload.push_str(&parsed.raw_arguments);
                            calls[*idx].arguments_json = resolve_arguments(payload);
                            continue;
                        }
                        None => {
                            let name = match parsed.name {
                                Some(n) => n,
                                None => continue,
                            };
                            calls.push(RawCall {
                                name,
                                arguments_json: resolve_arguments(&parsed.raw_arguments),
                            });
                            fragment_slot = Some((calls.len() - 1, parsed.raw_arguments));
                            continue;
                        }
                    }
                }

                let Some(name) = parsed.name else { continue };
                calls.push(RawCall {
                    name,
                    arguments_json: resolve_arguments(&parsed.raw_arguments),
                });
            }
        }
    }

    calls
}

struct TaggedCall {
    name: Option<String>,
    raw_arguments: String,
    is_fragment: bool,
    next: usize,
}

/// Parse a `<tool_call>`/`<function_call>` element starting at `start`.
fn parse_tagged(text: &str, start: usize, opener: Opener) -> Option<TaggedCall> {
    let tag_rest = &text[start + opener.tag().len()..];
    let gt = tag_rest.find('>')?;
    let attrs = &tag_rest[..gt];
    let body_start = start + opener.tag().len() + gt + 1;

    // Body runs to the matching closer, or on truncated output to the next
    // top-level opener or end of input.
    let (body_end, next) = match text[body_start..].find(opener.closer()) {
        Some(rel) => (body_start + rel, body_start + rel + opener.closer().len()),
        None => {
            let end = next_opener(text, body_start)
                .map(|(p, _)| p)
                .unwrap_or(text.len());
            (end, end)
        }
    };
    let body = &text[body_start..body_end];

    let name = attr_value(attrs, "name")
        .or_else(|| {
            match opener {
                Opener::ToolCall => inner_tag(body, &["tool_name", "name"]),
                _ => inner_tag(body, &["name"]),
            }
            .map(str::to_string)
        })
        .map(|n| unescape_entities(n.trim()))
        .filter(|n| !n.is_empty());

    let raw_arguments = inner_tag(body, &["tool_arguments", "arguments", "args"])
        .map(str::to_string)
        .unwrap_or_default();

    Some(TaggedCall {
        name,
        raw_arguments,
        is_fragment: opener == Opener::ToolCall && attr_value(attrs, "part").is_some(),
        next,
    })
}

/// Parse the legacy `<function=NAME><parameter=KEY>VALUE...` form.
///
/// Parameters frequently lack closing tags; each value runs until the next
/// parameter, a closing tag, or end of input.
fn parse_legacy(text: &str, start: usize) -> (Option<RawCall>, usize) {
    let after = start + "<function=".len();
    let Some(gt) = text[after..].find('>') else {
        return (None, text.len());
    };
    let name = unescape_entities(text[after..after + gt].trim());
    if name.is_empty() || name.contains('<') {
        return (None, after + gt + 1);
    }

    let body_start = after + gt + 1;
    let terminators = ["</tool_call>", "</function>"];
    let (body_end, next) = terminators
        .iter()
        .filter_map(|t| {
            text[body_start..]
                .find(t)
                .map(|rel| (body_start + rel, body_start + rel + t.len()))
        })
        .min()
        .unwrap_or((text.len(), text.len()));
    let body = &text[body_start..body_end];

    let mut args = Map::new();
    let mut cursor = 0;
    while let Some(rel) = body[cursor..].find("<parameter=") {
        let key_start = cursor + rel + "<parameter=".len();
        let Some(key_gt) = body[key_start..].find('>') else {
            break;
        };
        let key = unescape_entities(body[key_start..key_start + key_gt].trim());
        let value_start = key_start + key_gt + 1;

        let value_end = ["<parameter=", "</parameter>"]
            .iter()
            .filter_map(|t| body[value_start..].find(t))
            .min()
            .map(|rel| value_start + rel)
            .unwrap_or(body.len());
        let value = unescape_entities(body[value_start..value_end].trim());
        if !key.is_empty() {
            args.insert(key, Value::String(value));
        }
        cursor = value_end;
    }

    let call = RawCall {
        name,
        arguments_json: Value::Object(args).to_string(),
    };
    (Some(call), next)
}

// ============================================================================
// Argument Resolution
// ============================================================================

/// Resolve a raw argument payload into a JSON serialization.
///
/// JSON payloads pass through verbatim. XML payloads flatten direct children
/// into a string map (a `type="int"` attribute requests integer parsing, an
/// `args` wrapper is transparent). Anything else becomes `{}`.
fn resolve_arguments(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<Value>(trimmed).is_ok() {
            return trimmed.to_string();
        }
        let unescaped = unescape_entities(trimmed);
        if serde_json::from_str::<Value>(&unescaped).is_ok() {
            return unescaped;
        }
        return "{}".to_string();
    }

    if trimmed.starts_with('<') {
        return Value::Object(flatten_xml_children(trimmed)).to_string();
    }

    "{}".to_string()
}

/// Flatten the direct child elements of an XML payload into a JSON map.
fn flatten_xml_children(xml: &str) -> Map<String, Value> {
    // A single <args> wrapper is transparent.
    if let Some((tag, attrs, inner, rest)) = first_element(xml) {
        if tag == "args" && rest.trim().is_empty() && attrs.trim().is_empty() {
            return flatten_xml_children_inner(inner);
        }
    }
    flatten_xml_children_inner(xml)
}

fn flatten_xml_children_inner(xml: &str) -> Map<String, Value> {
    let mut out = Map::new();
    let mut rest = xml;
    while let Some((tag, attrs, inner, remaining)) = first_element(rest) {
        let text = unescape_entities(inner.trim());
        let value = if attr_value(&attrs, "type").as_deref() == Some("int") {
            match text.parse::<i64>() {
                Ok(n) => Value::Number(n.into()),
                Err(_) => Value::String(text),
            }
        } else {
            Value::String(text)
        };
        out.insert(tag, value);
        rest = remaining;
    }
    out
}

/// Extract the first element of `xml`: (tag, attributes, inner text, rest).
///
/// Tolerates a missing closing tag by consuming to end of input.
fn first_element(xml: &str) -> Option<(String, String, &str, &str)> {
    let lt = xml.find('<')?;
    let after_lt = &xml[lt + 1..];
    if after_lt.starts_with('/') {
        return None;
    }
    let gt = after_lt.find('>')?;
    let tag_and_attrs = &after_lt[..gt];

    // Self-closing element.
    if let Some(stripped) = tag_and_attrs.strip_suffix('/') {
        let (tag, attrs) = split_tag(stripped);
        if tag.is_empty() {
            return None;
        }
        let rest = &after_lt[gt + 1..];
        return Some((tag, attrs, "", rest));
    }

    let (tag, attrs) = split_tag(tag_and_attrs);
    if tag.is_empty() {
        return None;
    }

    let body_start = gt + 1;
    let closer = format!("</{}>", tag);
    match after_lt[body_start..].find(&closer) {
        Some(rel) => {
            let inner = &after_lt[body_start..body_start + rel];
            let rest = &after_lt[body_start + rel + closer.len()..];
            Some((tag, attrs, inner, rest))
        }
        None => Some((tag, attrs, &after_lt[body_start..], "")),
    }
}

fn split_tag(tag_and_attrs: &str) -> (String, String) {
    match tag_and_attrs.find(|c: char| c.is_ascii_whitespace()) {
        Some(ws) => (
            tag_and_attrs[..ws].to_string(),
            tag_and_attrs[ws..].to_string(),
        ),
        None => (tag_and_attrs.to_string(), String::new()),
    }
}

/// Pull a quoted attribute value out of an attribute string.
fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let mut search = 0;
    while let Some(rel) = attrs[search..].find(name) {
        let pos = search + rel;
        // Must be a standalone attribute name.
        let before_ok = pos == 0 || attrs.as_bytes()[pos - 1].is_ascii_whitespace();
        let after = &attrs[pos + name.len()..];
        let after_eq = after.trim_start();
        if before_ok {
            if let Some(rest) = after_eq.strip_prefix('=') {
                let rest = rest.trim_start();
                if let Some(stripped) = rest.strip_prefix('"') {
                    if let Some(end) = stripped.find('"') {
                        return Some(stripped[..end].to_string());
                    }
                }
            }
        }
        search = pos + name.len();
    }
    None
}

/// Find the inner text of the first tag among `names` inside `body`.
fn inner_tag<'a>(body: &'a str, names: &[&str]) -> Option<&'a str> {
    for name in names {
        let open_plain = format!("<{}>", name);
        let open_attr = format!("<{} ", name);
        let close = format!("</{}>", name);

        let start = body
            .find(&open_plain)
            .map(|p| p + open_plain.len())
            .or_else(|| {
                let p = body.find(&open_attr)?;
                let gt = body[p..].find('>')?;
                Some(p + gt + 1)
            });
        let Some(start) = start else { continue };

        let end = body[start..]
            .find(&close)
            .map(|rel| start + rel)
            .unwrap_or(body.len());
        return Some(&body[start..end]);
    }
    None
}
