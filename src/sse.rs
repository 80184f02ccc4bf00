//! Incremental decoder for `text/event-stream` bodies.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Turns arbitrarily split body chunks into events.
///
/// Only complete events are emitted: a payload split across chunks is buffered until the blank
/// line that terminates it arrives.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment, typically a keep-alive.
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // `id` and `retry` are not used: reconnects re-fetch the full document anyway.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<ServerEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        if data.is_empty() {
            return None;
        }
        Some(ServerEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::{EventDecoder, ServerEvent};

    fn event(name: Option<&str>, data: &str) -> ServerEvent {
        ServerEvent {
            event: name.map(str::to_owned),
            data: data.to_owned(),
        }
    }

    #[test]
    fn decodes_named_events() {
        let mut decoder = EventDecoder::default();
        let events = decoder.feed(b"event: features\ndata: {\"features\":{}}\n\n");
        assert_eq!(events, vec![event(Some("features"), "{\"features\":{}}")]);
    }

    #[test]
    fn buffers_events_split_across_chunks() {
        let mut decoder = EventDecoder::default();
        assert!(decoder.feed(b"event: feat").is_empty());
        assert!(decoder.feed(b"ures\r\ndata: {\"a\"").is_empty());
        assert!(decoder.feed(b":1}\r\n").is_empty());
        assert_eq!(
            decoder.feed(b"\r\n"),
            vec![event(Some("features"), "{\"a\":1}")]
        );
    }

    #[test]
    fn joins_multi_line_data() {
        let mut decoder = EventDecoder::default();
        let events = decoder.feed(b"data: first\ndata:second\n\n");
        assert_eq!(events, vec![event(None, "first\nsecond")]);
    }

    #[test]
    fn skips_comments_and_empty_events() {
        let mut decoder = EventDecoder::default();
        let events =
            decoder.feed(b": keep-alive\n\nevent: features\ndata:\n\nid: 7\n\ndata: x\n\n");
        assert_eq!(events, vec![event(None, "x")]);
    }

    #[test]
    fn event_name_does_not_leak_into_next_event() {
        let mut decoder = EventDecoder::default();
        let events = decoder.feed(b"event: features-updated\ndata: 1\n\ndata: 2\n\n");
        assert_eq!(
            events,
            vec![event(Some("features-updated"), "1"), event(None, "2")]
        );
    }
}
