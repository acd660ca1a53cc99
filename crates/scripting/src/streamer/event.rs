//! Output events produced by a streamer.

use bytes::Bytes;

/// The stream an [`OutputEvent`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Standard output (and merged standard error).
    Stdout,
    /// Standard error, when kept separate.
    Stderr,
    /// The terminal exit-code marker.
    ReturnCode,
}

impl Source {
    /// Returns the canonical name of the source.
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Stdout => "stdout",
            Source::Stderr => "stderr",
            Source::ReturnCode => "return_code",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a data event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw bytes as read from the pipe.
    Bytes(Bytes),
    /// A decoded line, produced by line reads with encoding management.
    Text(String),
}

impl Chunk {
    /// Returns the payload as bytes regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Bytes(bytes) => bytes,
            Chunk::Text(text) => text.as_bytes(),
        }
    }

    /// Returns the decoded text, if this chunk was decoded.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(text) => Some(text),
            Chunk::Bytes(_) => None,
        }
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit in the ordered sequence produced by a streamer.
///
/// Every streamer produces data events followed by exactly one
/// [`OutputEvent::ReturnCode`], which is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Data read from standard output.
    Stdout(Chunk),
    /// Data read from standard error.
    Stderr(Chunk),
    /// The process exit code. Terminal.
    ReturnCode(i32),
}

impl OutputEvent {
    pub(crate) fn data(source: Source, chunk: Chunk) -> Self {
        match source {
            Source::Stderr => OutputEvent::Stderr(chunk),
            _ => OutputEvent::Stdout(chunk),
        }
    }

    /// Returns the source of this event.
    pub fn source(&self) -> Source {
        match self {
            OutputEvent::Stdout(_) => Source::Stdout,
            OutputEvent::Stderr(_) => Source::Stderr,
            OutputEvent::ReturnCode(_) => Source::ReturnCode,
        }
    }

    /// Returns false only for the terminal return-code event.
    ///
    /// This is the event's truthiness: loops can run `while event.has_more()`.
    pub fn has_more(&self) -> bool {
        !matches!(self, OutputEvent::ReturnCode(_))
    }

    /// Returns the data payload, if this is a data event.
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            OutputEvent::Stdout(chunk) | OutputEvent::Stderr(chunk) => Some(chunk),
            OutputEvent::ReturnCode(_) => None,
        }
    }

    /// Returns the exit code, if this is the terminal event.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            OutputEvent::ReturnCode(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_is_terminal() {
        let event = OutputEvent::ReturnCode(3);
        assert!(!event.has_more());
        assert_eq!(event.source(), Source::ReturnCode);
        assert_eq!(event.return_code(), Some(3));
        assert!(event.chunk().is_none());
    }

    #[test]
    fn test_data_events_have_more() {
        let out = OutputEvent::Stdout(Chunk::Bytes(Bytes::from_static(b"out")));
        let err = OutputEvent::Stderr(Chunk::Text("err".to_string()));

        assert!(out.has_more());
        assert!(err.has_more());
        assert_eq!(out.source(), Source::Stdout);
        assert_eq!(err.source(), Source::Stderr);
        assert_eq!(out.chunk().map(Chunk::as_bytes), Some(&b"out"[..]));
        assert_eq!(err.chunk().and_then(Chunk::as_text), Some("err"));
        assert_eq!(out.return_code(), None);
    }

    #[test]
    fn test_data_constructor_maps_source() {
        let chunk = Chunk::Bytes(Bytes::from_static(b"x"));
        assert_eq!(
            OutputEvent::data(Source::Stderr, chunk.clone()).source(),
            Source::Stderr
        );
        assert_eq!(OutputEvent::data(Source::Stdout, chunk).source(), Source::Stdout);
    }

    #[test]
    fn test_source_names() {
        assert_eq!(Source::Stdout.to_string(), "stdout");
        assert_eq!(Source::Stderr.to_string(), "stderr");
        assert_eq!(Source::ReturnCode.to_string(), "return_code");
    }
}
