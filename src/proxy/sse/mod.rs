// SSE helpers shared by the dispatcher
//
// The backend streams `data: <json>\n\n` frames with a terminal
// `data: [DONE]\n\n`. Only detection lives here; the per-response filtering
// is the stream rewriter's job.

/// Check if a response is SSE based on content-type header
pub fn is_sse_response(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}
