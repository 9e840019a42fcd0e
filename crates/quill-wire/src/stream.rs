//! Line framing for streamed responses
//!
//! The chat endpoint answers with a long-lived body of newline-delimited text.
//! Every line starting with `data: ` carries one JSON `{type, data}` record;
//! any other line (keep-alives, comments, blank separators) is skipped.

use crate::error::{Error, Result};
use crate::types::{Envelope, ServerEvent};
use async_stream::stream;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Prefix marking a line that carries a message
pub const DATA_PREFIX: &str = "data: ";

/// A stream of decoded chat events.
///
/// Yields at most one `Err`, after which the stream ends.
pub type ServerEventStream = Pin<Box<dyn Stream<Item = Result<ServerEvent>> + Send>>;

/// Incremental splitter turning arbitrary byte chunks into text lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    ///
    /// Bytes after the last newline stay buffered, so a line (or a multi-byte
    /// character) split across chunks is reassembled.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = vec![];
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            lines.push(decode_line(&line_bytes[..newline_pos]));
        }
        lines
    }

    /// Flush whatever is left once the transport has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode one line into an event.
///
/// Returns `None` for lines without the data prefix and for payloads that do
/// not decode; the latter are logged and dropped so the stream can go on.
pub fn parse_line(line: &str) -> Option<ServerEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?;

    let envelope = match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Dropping malformed stream event: {}", e);
            return None;
        }
    };

    let kind = envelope.kind.clone();
    match ServerEvent::from_envelope(envelope) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Dropping '{}' event with unexpected payload: {}", kind, e);
            None
        }
    }
}

/// Turn a response body into a lazy sequence of events.
///
/// The sequence ends when the body ends. A transport error is forwarded once
/// and terminates the sequence.
pub fn read_events<S, B, E>(body: S) -> ServerEventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<Error> + Send,
{
    Box::pin(stream! {
        let mut body = Box::pin(body);
        let mut decoder = LineDecoder::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in decoder.push(bytes.as_ref()) {
                        if let Some(event) = parse_line(&line) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        if let Some(line) = decoder.finish() {
            if let Some(event) = parse_line(&line) {
                yield Ok(event);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, Error>> + Send {
        let owned: Vec<std::result::Result<Vec<u8>, Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures::stream::iter(owned)
    }

    async fn collect(stream: ServerEventStream) -> Vec<Result<ServerEvent>> {
        stream.collect().await
    }

    #[test]
    fn test_line_decoder_reassembles_split_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"ty").is_empty());
        let lines = decoder.push(b"pe\":\"done\"}\r\nnext");
        assert_eq!(lines, vec!["data: {\"type\":\"done\"}".to_string()]);
        assert_eq!(decoder.finish(), Some("next".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_split_utf8() {
        let text = "data: é\n".as_bytes();
        let mut decoder = LineDecoder::new();
        // 'é' is two bytes; split between them
        assert!(decoder.push(&text[..7]).is_empty());
        assert_eq!(decoder.push(&text[7..]), vec!["data: é".to_string()]);
    }

    #[test]
    fn test_parse_line_ignores_unprefixed() {
        assert!(parse_line(": keep-alive").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("event: message").is_none());
        assert!(parse_line("data:{\"type\":\"done\"}").is_none());
    }

    #[test]
    fn test_parse_line_drops_malformed_json() {
        assert!(parse_line("data: {not json").is_none());
        assert!(parse_line("data: {\"type\":\"step\",\"data\":{\"step\":\"one\"}}").is_none());
    }

    #[tokio::test]
    async fn test_read_events_in_order_across_chunks() {
        let body = chunks(&[
            "data: {\"type\":\"thinking\",\"data\":{\"message\":\"Reading\"}}\n: ping\n",
            "data: {\"type\":\"step\",\"data\":{\"step\":1,\"description\":\"Scan\",",
            "\"status\":\"in_progress\"}}\n\ndata: {broken}\n",
            "data: {\"type\":\"done\",\"data\":{}}",
        ]);
        let events: Vec<ServerEvent> = collect(read_events(body))
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind(), "thinking");
        match &events[1] {
            ServerEvent::Step(step) => {
                assert_eq!(step.step, 1);
                assert_eq!(step.status, StepStatus::InProgress);
            }
            other => panic!("expected step, got {:?}", other),
        }
        assert_eq!(events[2], ServerEvent::Done);
    }

    #[tokio::test]
    async fn test_read_events_stops_at_transport_error() {
        let parts: Vec<std::result::Result<Vec<u8>, Error>> = vec![
            Ok(b"data: {\"type\":\"message\",\"data\":{\"message\":\"hi\"}}\n".to_vec()),
            Err(Error::Sse("connection reset".into())),
            Ok(b"data: {\"type\":\"done\"}\n".to_vec()),
        ];
        let results = collect(read_events(futures::stream::iter(parts))).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Sse(_))));
    }

    #[tokio::test]
    async fn test_read_events_empty_body() {
        let results = collect(read_events(chunks(&[]))).await;
        assert!(results.is_empty());
    }
}
