use tracing::warn;

use crate::config::DecodeMode;
use crate::constants::{SSE_DATA_PREFIX, SSE_DONE_SENTINEL};
use crate::models::{ChatChunk, GenerateChunk};

/// A decoded framing unit from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A content fragment to append to the accumulated answer.
    Delta(String),
    /// The stream signalled completion; no further events will follow.
    Done,
}

/// Incremental decoder over the raw upstream byte stream. Implementations
/// own the carry-over buffer for the incomplete trailing line, so results do
/// not depend on where chunk boundaries fall.
pub trait FrameDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<FrameEvent>;
}

pub fn decoder_for(mode: DecodeMode) -> Box<dyn FrameDecoder> {
    match mode {
        DecodeMode::Ndjson => Box::new(NdjsonDecoder::new()),
        DecodeMode::Sse => Box::new(SseDecoder::new()),
    }
}

// Line reassembly shared by both decoders: completed lines are handed to the
// caller, the trailing partial line stays buffered. Splitting on the byte
// `\n` keeps multi-byte characters intact across chunk boundaries.
fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline_index) = buffer.iter().position(|&byte| byte == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=newline_index).collect();
        lines.push(String::from_utf8_lossy(&line_bytes).trim().to_string());
    }
    lines
}

/// Decoder for newline-delimited JSON generate streams
/// (`{"response": "...", "done": false}` per line).
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            finished: false,
        }
    }
}

impl FrameDecoder for NdjsonDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        for line in drain_complete_lines(&mut self.buffer) {
            if line.is_empty() {
                continue;
            }

            // The backend may interleave non-JSON keep-alive noise.
            let Ok(parsed) = serde_json::from_str::<GenerateChunk>(&line) else {
                warn!(phase = "ndjson_line_skipped", "skipping unparseable stream line: {line}");
                continue;
            };

            if let Some(fragment) = parsed.response {
                if !fragment.is_empty() {
                    events.push(FrameEvent::Delta(fragment));
                }
            }
            if parsed.done {
                self.finished = true;
                events.push(FrameEvent::Done);
                break;
            }
        }

        events
    }
}

/// Decoder for Server-Sent-Event chat-completions streams (`data: <json>`
/// lines, terminated by `data: [DONE]`).
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            finished: false,
        }
    }
}

impl FrameDecoder for SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        for line in drain_complete_lines(&mut self.buffer) {
            if line.is_empty() {
                continue;
            }

            let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
                // Event-name lines and comments carry no content.
                continue;
            };
            let data = data.trim_start();

            if data == SSE_DONE_SENTINEL {
                self.finished = true;
                events.push(FrameEvent::Done);
                break;
            }

            let Ok(parsed) = serde_json::from_str::<ChatChunk>(data) else {
                warn!(phase = "sse_line_skipped", "skipping unparseable data line: {data}");
                continue;
            };

            let Some(content) = parsed
                .choices
                .first()
                .and_then(|choice| choice.delta.content.as_deref())
            else {
                continue;
            };
            if !content.is_empty() {
                events.push(FrameEvent::Delta(content.to_string()));
            }
        }

        events
    }
}
