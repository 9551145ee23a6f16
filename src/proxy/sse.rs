//! Incremental Server-Sent Events parser for the response tee.
//!
//! Fed raw body chunks as they stream through; emits an event per
//! blank-line delimiter with `data:` lines concatenated. Chunk boundaries
//! can fall anywhere, including mid-line.

/// One well-formed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
    data_lines: Vec<String>,
    id: Option<String>,
    event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // Dispatch only when data accumulated; a lone blank line or an
            // id/event-only block resets without emitting.
            if !self.data_lines.is_empty() {
                events.push(SseEvent {
                    id: self.id.take(),
                    event: self.event.take(),
                    data: self.data_lines.join("\n"),
                });
            } else {
                self.id = None;
                self.event = None;
            }
            self.data_lines.clear();
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event_with_id() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: e1\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("e1"));
        assert_eq!(events[0].data, r#"{"x":1}"#);
    }

    #[test]
    fn chunk_boundary_mid_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"ha").is_empty());
        assert!(parser.feed(b"lf\":true}").is_empty());
        let events = parser.feed(b"\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"half":true}"#);
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn comments_and_crlf_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\r\nevent: message\r\ndata: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: e1\ndata: a\n\nid: e2\ndata: b\n\nid: e3\ndata: c\n\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].id.as_deref(), Some("e3"));
    }

    #[test]
    fn id_only_block_does_not_dispatch() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: e9\n\n").is_empty());
        // The stale id does not leak into the next event.
        let events = parser.feed(b"data: x\n\n");
        assert_eq!(events[0].id, None);
    }
}
