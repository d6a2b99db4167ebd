//! Delta extraction from parsed SSE frames.
//!
//! Consumes [`SseFrame`]s and reduces them to a sequence of text deltas
//! and structured tool-call events: deduplicates tool responses by
//! message id, collapses streamed tool-call argument fragments into
//! complete calls, and converts cumulative content into incremental
//! deltas.

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_json::Value;

use super::sse::SseFrame;

/// One unit of semantically meaningful output, produced in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// An incremental fragment of assistant text.
    Text(String),
    /// A new tool call has started; arguments may still be streaming.
    ToolCallStart { name: String, id: String },
    /// A complete tool call with its final arguments.
    ToolCall {
        name: String,
        id: String,
        args: ToolArgs,
    },
    /// The backend reports a tool finished executing.
    ToolResponse { name: String },
    /// A backend-reported error, passed through verbatim.
    Error(String),
}

/// Final tool-call arguments: parsed JSON when the accumulated buffer is
/// valid, the raw accumulated text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    Json(Value),
    Raw(String),
}

/// In-progress tool call: name and id arrive first, argument text is
/// appended as fragments stream in, and the buffer is JSON-parsed only at
/// the terminal flush (partial JSON cannot reliably be parsed mid-stream).
#[derive(Debug)]
struct ToolCallAccumulator {
    name: String,
    id: String,
    args: String,
}

/// Per-stream decode state.
///
/// One instance per streaming connection: created when the stream begins,
/// dropped when it closes. Never shared between concurrent streams and
/// never reused across them.
#[derive(Default)]
pub struct StreamDecoder {
    current_tool_call: Option<ToolCallAccumulator>,
    seen_tool_message_ids: FxHashSet<String>,
    last_content: String,
}

// ---------------------------------------------------------------------------
// Wire message shapes
// ---------------------------------------------------------------------------

/// A message from the backend stream, dispatched on its `type` tag.
/// Unknown kinds fall into the explicit ignore arm.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "AIMessageChunk")]
    AssistantChunk(AssistantChunk),
    #[serde(rename = "tool")]
    ToolResult(ToolResult),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AssistantChunk {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    tool_calls: Vec<ToolCallDescriptor>,
    #[serde(default)]
    tool_call_chunks: Vec<ToolCallChunk>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct ToolCallDescriptor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    args: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolResult {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// `args` carrying `null`, `{}`, or `""` means the arguments are still
/// streaming; anything else is a complete structured payload.
fn args_are_populated(args: &Value) -> bool {
    match args {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one frame, mutating the per-stream state and returning
    /// zero or more deltas.
    ///
    /// Decode-level failures (malformed JSON, unexpected shapes) are
    /// absorbed here: they are logged as diagnostics and never terminate
    /// the stream.
    pub fn process(&mut self, frame: &SseFrame) -> Vec<Delta> {
        let mut out = Vec::new();
        let Some(data) = frame.data.as_deref() else {
            return out;
        };

        match frame.event.as_deref() {
            Some("error") => {
                // Error payloads are free text; no JSON parsing attempted.
                out.push(Delta::Error(data.to_string()));
            }
            Some("metadata" | "messages/metadata") => {
                // Diagnostic-only field: validate, emit nothing.
                if let Err(e) = serde_json::from_str::<Value>(data) {
                    tracing::debug!(error = %e, "malformed metadata event ignored");
                }
            }
            Some("messages" | "messages/partial") => {
                self.process_messages_data(data, &mut out);
            }
            _ => {}
        }
        out
    }

    fn process_messages_data(&mut self, data: &str, out: &mut Vec<Delta>) {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "malformed messages event ignored");
                return;
            }
        };

        // Messages-tuple mode sends [message, run_metadata]; some modes
        // send the message object directly.
        let message_value = match parsed {
            Value::Array(mut items) if items.len() == 2 => items.swap_remove(0),
            object @ Value::Object(_) => object,
            _ => return,
        };

        let message: StreamMessage = match serde_json::from_value(message_value) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "unrecognized message shape ignored");
                return;
            }
        };

        match message {
            StreamMessage::AssistantChunk(chunk) => self.process_assistant_chunk(&chunk, out),
            StreamMessage::ToolResult(result) => self.process_tool_result(&result, out),
            StreamMessage::Unknown => {}
        }
    }

    fn process_assistant_chunk(&mut self, chunk: &AssistantChunk, out: &mut Vec<Delta>) {
        let mut handled_tool_fields = false;

        // A descriptor with both name and id starts a new tool call. Unnamed
        // descriptors (incremental JSON-patch updates) carry nothing usable
        // at this level but still mark the frame as tool-related.
        if let Some(call) = chunk.tool_calls.first() {
            handled_tool_fields = true;
            let id = call.id.as_deref().unwrap_or_default();
            if !call.name.is_empty() && !id.is_empty() {
                self.current_tool_call = Some(ToolCallAccumulator {
                    name: call.name.clone(),
                    id: id.to_string(),
                    args: String::new(),
                });
                out.push(Delta::ToolCallStart {
                    name: call.name.clone(),
                    id: id.to_string(),
                });

                // Complete structured arguments in the starting frame:
                // flush immediately, nothing left to accumulate.
                if let Some(args) = &call.args {
                    if args_are_populated(args) {
                        out.push(Delta::ToolCall {
                            name: call.name.clone(),
                            id: id.to_string(),
                            args: ToolArgs::Json(args.clone()),
                        });
                        self.current_tool_call = None;
                    }
                }
            }
        }

        // Streamed argument fragments append to the active accumulator;
        // the starting frame may already carry the first fragment.
        if !chunk.tool_call_chunks.is_empty() {
            handled_tool_fields = true;
            if let Some(accumulator) = &mut self.current_tool_call {
                for fragment in &chunk.tool_call_chunks {
                    if let Some(args) = fragment.args.as_deref() {
                        accumulator.args.push_str(args);
                    }
                }
            }
        }

        // Terminal flush: must fire even when no explicit "complete args"
        // signal ever arrived.
        if chunk.response_metadata.finish_reason.as_deref() == Some("tool_calls") {
            handled_tool_fields = true;
            self.flush_tool_call(out);
        }

        if handled_tool_fields {
            return;
        }

        if let Some(content) = chunk.content.as_str() {
            self.process_content(content, out);
        }
    }

    /// Emit the increment between the last emitted content and the new
    /// content. Backends in cumulative mode resend the full string each
    /// frame; true-delta backends never extend, so each frame is emitted
    /// whole.
    fn process_content(&mut self, content: &str, out: &mut Vec<Delta>) {
        if content.is_empty() {
            return;
        }

        if content.starts_with(self.last_content.as_str()) {
            let delta = &content[self.last_content.len()..];
            if !delta.is_empty() {
                out.push(Delta::Text(delta.to_string()));
            }
        } else {
            // May mask an out-of-order backend rather than a legitimate
            // reset; logged distinctly so it is visible in diagnostics.
            tracing::warn!(
                previous_len = self.last_content.len(),
                new_len = content.len(),
                "content does not extend previous value, emitting full replacement"
            );
            out.push(Delta::Text(content.to_string()));
        }
        self.last_content = content.to_string();
    }

    fn process_tool_result(&mut self, result: &ToolResult, out: &mut Vec<Delta>) {
        // Only tool messages are deduplicated; assistant chunks are
        // legitimately repeated and extended across frames.
        if let Some(id) = result.id.as_deref() {
            if !self.seen_tool_message_ids.insert(id.to_string()) {
                return;
            }
        }
        out.push(Delta::ToolResponse {
            name: result
                .name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        });
    }

    fn flush_tool_call(&mut self, out: &mut Vec<Delta>) {
        let Some(accumulator) = self.current_tool_call.take() else {
            return;
        };
        let args = match serde_json::from_str::<Value>(&accumulator.args) {
            Ok(value) => ToolArgs::Json(value),
            Err(_) => ToolArgs::Raw(accumulator.args),
        };
        out.push(Delta::ToolCall {
            name: accumulator.name,
            id: accumulator.id,
            args,
        });
    }
}
