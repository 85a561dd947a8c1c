//! Line decoder for `text/event-stream` chat-completion responses.
//!
//! Bytes are buffered and split into lines. `data:` lines carry a JSON
//! fragment or the `[DONE]` end marker; an error object or `error:` line
//! ends the stream with a fault, as does a run of blank keep-alive lines.

use crate::error::LlmError;
use crate::llm::provider::ChatCompletionChunk;

/// Consecutive blank lines after which the stream is considered broken.
pub const MAX_BLANK_LINES: usize = 300;

/// A decoded stream item.
#[derive(Debug, Clone)]
pub enum SseItem {
    Chunk(ChatCompletionChunk),
    /// The `[DONE]` end marker.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    blank_run: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and decode every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<SseItem, LlmError>> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            // A complete line never ends inside a multi-byte character.
            if let Some(item) = self.decode_line(&String::from_utf8_lossy(&line)) {
                items.push(item);
            }
        }
        items
    }

    /// Decode whatever partial line remains once the body has closed.
    pub fn finish(&mut self) -> Vec<Result<SseItem, LlmError>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        if rest.trim().is_empty() {
            return Vec::new();
        }
        self.decode_line(&rest).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &str) -> Option<Result<SseItem, LlmError>> {
        let line = raw.trim();
        if line.is_empty() {
            self.blank_run += 1;
            if self.blank_run >= MAX_BLANK_LINES {
                return Some(Err(LlmError::StreamFault(format!(
                    "{MAX_BLANK_LINES} consecutive blank lines"
                ))));
            }
            return None;
        }
        self.blank_run = 0;

        if let Some(message) = line.strip_prefix("error:") {
            return Some(Err(LlmError::StreamFault(message.trim().to_string())));
        }
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() {
            return None;
        }
        if data == "[DONE]" {
            return Some(Ok(SseItem::Done));
        }

        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return Some(Err(LlmError::Json(e))),
        };
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Some(Err(LlmError::StreamFault(message)));
        }
        Some(
            serde_json::from_value::<ChatCompletionChunk>(value)
                .map(SseItem::Chunk)
                .map_err(LlmError::Json),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_json(content: &str) -> String {
        format!(r#"{{"id":"c","choices":[{{"index":0,"delta":{{"content":"{content}"}}}}]}}"#)
    }

    #[test]
    fn decodes_fragments_and_done() {
        let mut decoder = SseDecoder::new();
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            chunk_json("Hel"),
            chunk_json("lo")
        );
        let items = decoder.push(body.as_bytes());
        assert_eq!(items.len(), 3);
        match &items[1] {
            Ok(SseItem::Chunk(c)) => assert_eq!(c.content(), Some("lo")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(items[2], Ok(SseItem::Done)));
    }

    #[test]
    fn lines_split_across_reads() {
        let mut decoder = SseDecoder::new();
        let line = format!("data: {}\n", chunk_json("abc"));
        let (a, b) = line.split_at(10);
        assert!(decoder.push(a.as_bytes()).is_empty());
        let items = decoder.push(b.as_bytes());
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn character_split_across_reads() {
        let mut decoder = SseDecoder::new();
        let line = format!("data: {}\n", chunk_json("café"));
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        let items = decoder.push(&bytes[split..]);
        match &items[0] {
            Ok(SseItem::Chunk(c)) => assert_eq!(c.content(), Some("café")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_object_is_a_fault() {
        let mut decoder = SseDecoder::new();
        let items = decoder.push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        match &items[0] {
            Err(LlmError::StreamFault(msg)) => assert_eq!(msg, "overloaded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_line_is_a_fault() {
        let mut decoder = SseDecoder::new();
        let items = decoder.push(b"error: upstream reset\n");
        assert!(matches!(items[0], Err(LlmError::StreamFault(_))));
    }

    #[test]
    fn blank_line_flood_is_a_fault() {
        let mut decoder = SseDecoder::new();
        let almost = "\n".repeat(MAX_BLANK_LINES - 1);
        assert!(decoder.push(almost.as_bytes()).is_empty());
        let items = decoder.push(b"\n");
        assert!(matches!(items[0], Err(LlmError::StreamFault(_))));
    }

    #[test]
    fn data_line_resets_blank_run() {
        let mut decoder = SseDecoder::new();
        let mut body = "\n".repeat(MAX_BLANK_LINES - 1);
        body.push_str(": keep-alive comment\n");
        body.push_str(&"\n".repeat(MAX_BLANK_LINES - 1));
        assert!(decoder.push(body.as_bytes()).is_empty());
    }

    #[test]
    fn finish_flushes_partial_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        let items = decoder.finish();
        assert!(matches!(items[0], Ok(SseItem::Done)));
    }
}
