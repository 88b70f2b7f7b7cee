//! Server-Sent Events parsing for streamed chat completions

use serde_json::Value;

/// Maximum buffer size (1MB) to prevent unbounded memory growth from malformed streams.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Incremental SSE parser.
///
/// Buffers incoming bytes and yields complete events. Events are separated by
/// a blank line; multiple `data:` lines of one event are joined with `\n`.
///
/// ```text
/// data: {"choices":[{"delta":{"content":"Hello"}}]}
///
/// data: [DONE]
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    truncated: bool,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event they complete.
    ///
    /// Bytes are decoded only once an event is complete, so multi-byte
    /// characters split across network chunks survive intact.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        // Servers may use CRLF line endings
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        if self.buffer.len() > MAX_BUFFER_SIZE {
            if !self.truncated {
                tracing::warn!(
                    "SSE buffer exceeded {} bytes, truncating. This may indicate a malformed stream.",
                    MAX_BUFFER_SIZE
                );
                self.truncated = true;
            }
            let target_start = self.buffer.len() - MAX_BUFFER_SIZE / 2;
            let start = match self.buffer[target_start..].iter().position(|b| *b == b'\n') {
                Some(pos) => target_start + pos + 1,
                None => next_char_start(&self.buffer, target_start),
            };
            self.buffer.drain(..start);
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&raw)) {
                events.push(event);
            }
            self.truncated = false;
        }
        events
    }

    /// Whether an incomplete event is buffered.
    pub fn has_buffered_data(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

/// First index at or after `from` that does not fall inside a UTF-8 sequence
fn next_char_start(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| b & 0xC0 != 0x80)
        .map_or(bytes.len(), |pos| from + pos)
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let data_lines: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    if data.trim() == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data))
}

/// A single Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Event payload (JSON for chat completions)
    Data(String),
    /// End of stream marker (`[DONE]`)
    Done,
}

/// What one streamed chat-completion chunk carries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Whether the chunk carries generated content
    pub has_content: bool,
    /// `usage.prompt_tokens`, when present
    pub prompt_tokens: Option<u64>,
    /// `usage.completion_tokens`, when present
    pub completion_tokens: Option<u64>,
}

impl ChunkSummary {
    /// Summarize one chunk's JSON payload; `None` if it is not valid JSON
    pub fn parse(data: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(data).ok()?;

        let has_content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .is_some_and(|content| !content.is_empty());

        let usage = value.get("usage");
        let usage_field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_u64);

        Some(Self {
            has_content,
            prompt_tokens: usage_field("prompt_tokens"),
            completion_tokens: usage_field("completion_tokens"),
        })
    }
}
