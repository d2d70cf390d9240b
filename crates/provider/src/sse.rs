//! Incremental line and Server-Sent-Events framing.
//!
//! Network reads split the body at arbitrary byte offsets, so both parsers
//! keep the trailing partial line between calls to `push_chunk`.

/// Splits a byte stream into `\n`-terminated lines, stripping a trailing
/// `\r`. Bytes after the last newline are held until more data arrives or
/// [`LineBuffer::finish`] is called.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(position) = rest.iter().position(|byte| *byte == b'\n') {
            self.pending.extend_from_slice(&rest[..position]);
            lines.push(strip_carriage_return(std::mem::take(&mut self.pending)));
            rest = &rest[position + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Returns the unterminated final line, if any.
    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(strip_carriage_return(std::mem::take(&mut self.pending)))
        }
    }
}

fn strip_carriage_return(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// An SSE event with an optional `event:` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) event_type: Option<String>,
    pub(crate) data: String,
}

/// SSE parser capturing both `event:` and `data:` lines. Multiple `data:`
/// lines in one event are joined with `\n`; a blank line dispatches.
#[derive(Debug, Default)]
pub(crate) struct SseEventParser {
    lines: LineBuffer,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseEventParser {
    pub(crate) fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, String> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            self.process_line(&line, &mut events)?;
        }
        Ok(events)
    }

    pub(crate) fn finish(&mut self) -> Result<Vec<SseEvent>, String> {
        let mut events = Vec::new();
        if let Some(line) = self.lines.finish() {
            self.process_line(&line, &mut events)?;
        }
        self.flush_event(&mut events);
        Ok(events)
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<SseEvent>) -> Result<(), String> {
        if line.is_empty() {
            self.flush_event(events);
            return Ok(());
        }

        if line.starts_with(b":") {
            return Ok(());
        }

        if let Some(value) = field_value(line, b"event:") {
            let value = std::str::from_utf8(value)
                .map_err(|error| format!("invalid UTF-8 in SSE event line: {error}"))?;
            self.event_type = Some(value.to_owned());
            return Ok(());
        }

        if let Some(data) = field_value(line, b"data:") {
            let data = std::str::from_utf8(data)
                .map_err(|error| format!("invalid UTF-8 in SSE data line: {error}"))?;
            self.data_lines.push(data.to_owned());
        }

        Ok(())
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if !self.data_lines.is_empty() {
            events.push(SseEvent {
                event_type: self.event_type.take(),
                data: self.data_lines.join("\n"),
            });
            self.data_lines.clear();
        } else {
            // Discard event type without data.
            self.event_type = None;
        }
    }
}

/// Strips an SSE field prefix and the single optional space after it.
pub(crate) fn field_value<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    let value = line.strip_prefix(prefix)?;
    Some(value.strip_prefix(b" ").unwrap_or(value))
}
