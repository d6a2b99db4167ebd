//! Incremental SSE frame parser.
//!
//! Splits a raw byte stream into discrete Server-Sent-Events frames
//! (`event`/`data` field pairs), tolerating arbitrary split points across
//! network reads. Field parsing follows the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html)
//! for the fields this gateway cares about; unknown fields and comment
//! lines are ignored.

use std::sync::LazyLock;

use memchr::memmem;

/// One parsed SSE frame prior to semantic interpretation.
///
/// A frame carrying neither `event` nor `data` is never emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
}

static LF_LF_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\n\n"));
static CRLF_CRLF_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\r\n\r\n"));

/// Find the earliest full-frame terminator (`\n\n` or `\r\n\r\n`) at or
/// after `scan_from`, returning `(position, terminator_len)`.
fn find_frame_terminator(buffer: &[u8], scan_from: usize) -> Option<(usize, usize)> {
    let scan_from = scan_from.min(buffer.len());
    let haystack = &buffer[scan_from..];
    let lf_lf = LF_LF_FINDER.find(haystack).map(|rel| scan_from + rel);
    let crlf_crlf = CRLF_CRLF_FINDER.find(haystack).map(|rel| scan_from + rel);

    match (lf_lf, crlf_crlf) {
        (Some(lf), Some(crlf)) => {
            if lf <= crlf {
                Some((lf, 2))
            } else {
                Some((crlf, 4))
            }
        }
        (Some(lf), None) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

/// Incremental SSE frame parser.
///
/// Feed it raw bytes (arriving at arbitrary boundaries) and it yields
/// fully-assembled [`SseFrame`]s. Partial trailing data is retained
/// internally for the next call; no partial frame is ever emitted and no
/// frame is emitted twice.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    scan_from: usize,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any complete frames parsed.
    ///
    /// Undecodable byte sequences inside a frame are replaced, never
    /// raised: the payloads this parser sees come from an uncontrolled
    /// backend and must not be able to kill the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((pos, terminator_len)) = find_frame_terminator(&self.buffer, self.scan_from)
        {
            let frame_text = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
            self.buffer.drain(..pos + terminator_len);
            self.scan_from = 0;
            if let Some(frame) = parse_frame_text(&frame_text) {
                frames.push(frame);
            }
        }

        // Keep a tiny overlap so a terminator split across reads is still
        // found by the next scan.
        self.scan_from = self.buffer.len().saturating_sub(3);
        frames
    }
}

/// Parse the text of one complete frame into its fields.
///
/// Returns `None` when the frame carries neither `event` nor `data`
/// (heartbeats, pure comments) — not an error, just nothing to emit.
fn parse_frame_text(text: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for mut line in text.split('\n') {
        if let Some(stripped) = line.strip_suffix('\r') {
            line = stripped;
        }
        if line.is_empty() {
            continue;
        }
        // Comment line per the SSE spec.
        if line.starts_with(':') {
            continue;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            event = Some(value.to_string());
        }
        // Unknown field names are ignored for forward compatibility.
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseFrame { event, data })
}
