//! Incremental reader for the data-chat response body.
//!
//! The service answers with one JSON array of messages, flushed as the
//! messages are produced. [`ArrayScanner`] splits that array into elements
//! as bytes arrive so each system message can be merged before the rest of
//! the body is read.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use insight_core::errors::GatewayError;
use insight_core::insight::RawChunk;

/// Chunks of one analytics answer, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<RawChunk, GatewayError>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ScanState {
    #[default]
    BeforeArray,
    BetweenElements,
    InElement,
    Closed,
}

/// Splits a top-level JSON array into elements. Only structural bytes are
/// inspected while scanning; an element is parsed once it is complete.
#[derive(Debug, Default)]
pub struct ArrayScanner {
    buf: Vec<u8>,
    pos: usize,
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    state: ScanState,
}

impl ArrayScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every element completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Value>, GatewayError> {
        self.buf.extend_from_slice(bytes);
        let mut complete = Vec::new();

        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            match self.state {
                ScanState::BeforeArray => {
                    if b == b'[' {
                        self.state = ScanState::BetweenElements;
                    } else if !b.is_ascii_whitespace() {
                        return Err(malformed("expected a list of messages"));
                    }
                }
                ScanState::BetweenElements => {
                    if b == b']' {
                        self.state = ScanState::Closed;
                    } else if b != b',' && !b.is_ascii_whitespace() {
                        self.start = Some(self.pos);
                        self.state = ScanState::InElement;
                        // Rescan this byte as the element's first.
                        continue;
                    }
                }
                ScanState::InElement if self.in_string => {
                    if self.escaped {
                        self.escaped = false;
                    } else if b == b'\\' {
                        self.escaped = true;
                    } else if b == b'"' {
                        self.in_string = false;
                    }
                }
                ScanState::InElement => match b {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            complete.push(self.take_element(self.pos + 1)?);
                            self.state = ScanState::BetweenElements;
                        }
                    }
                    // End of a bare scalar element.
                    b',' | b']' => {
                        complete.push(self.take_element(self.pos)?);
                        self.state = if b == b']' {
                            ScanState::Closed
                        } else {
                            ScanState::BetweenElements
                        };
                    }
                    _ => {}
                },
                ScanState::Closed => {
                    if !b.is_ascii_whitespace() {
                        return Err(malformed("data after the end of the message list"));
                    }
                }
            }
            self.pos += 1;
        }

        self.compact();
        Ok(complete)
    }

    /// Check the body ended on a closed array.
    pub fn finish(&self) -> Result<(), GatewayError> {
        match self.state {
            ScanState::Closed => Ok(()),
            ScanState::BeforeArray => Err(malformed("expected a list of messages")),
            _ => Err(malformed("response ended inside the message list")),
        }
    }

    fn take_element(&mut self, end: usize) -> Result<Value, GatewayError> {
        let start = self.start.take().unwrap_or(end);
        serde_json::from_slice(&self.buf[start..end]).map_err(|e| malformed(&e.to_string()))
    }

    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.pos);
        self.buf.drain(..keep_from);
        self.pos -= keep_from;
        if let Some(start) = self.start.as_mut() {
            *start -= keep_from;
        }
    }
}

fn malformed(reason: &str) -> GatewayError {
    GatewayError::MalformedResponse(reason.to_string())
}

/// The system message of a response element, if it carries one. User and
/// other message kinds are not part of the answer.
pub fn system_message(mut message: Value) -> Option<RawChunk> {
    message
        .get_mut("systemMessage")
        .map(Value::take)
        .map(RawChunk::classify)
}

struct Reader<S> {
    body: Pin<Box<S>>,
    scanner: ArrayScanner,
    pending: VecDeque<RawChunk>,
    cancel: CancellationToken,
    done: bool,
}

/// Adapt a response body into a chunk stream. Each system message is
/// yielded as soon as its bytes are complete. Cancellation ends the stream
/// with [`GatewayError::Cancelled`].
pub fn message_chunks<S, B, E>(body: S, cancel: CancellationToken) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let reader = Reader {
        body: Box::pin(body),
        scanner: ArrayScanner::new(),
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    futures::stream::unfold(reader, |mut r| async move {
        loop {
            if let Some(chunk) = r.pending.pop_front() {
                return Some((Ok(chunk), r));
            }
            if r.done {
                return None;
            }

            let next = tokio::select! {
                biased;
                () = r.cancel.cancelled() => Err(GatewayError::Cancelled),
                next = r.body.next() => Ok(next),
            };
            let failure = match next {
                Err(e) => Some(e),
                Ok(Some(Ok(bytes))) => match r.scanner.feed(bytes.as_ref()) {
                    Ok(messages) => {
                        r.pending
                            .extend(messages.into_iter().filter_map(system_message));
                        None
                    }
                    Err(e) => Some(e),
                },
                Ok(Some(Err(e))) => Some(GatewayError::NetworkError(e.to_string())),
                Ok(None) => {
                    r.done = true;
                    r.scanner.finish().err()
                }
            };
            if let Some(e) = failure {
                r.done = true;
                r.pending.clear();
                return Some((Err(e), r));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_in_pieces(body: &str, piece: usize) -> Vec<Result<Vec<u8>, String>> {
        body.as_bytes()
            .chunks(piece)
            .map(|c| Ok(c.to_vec()))
            .collect()
    }

    #[test]
    fn scanner_splits_elements_across_feeds() {
        let mut scanner = ArrayScanner::new();
        assert!(scanner.feed(b"[{\"a\": \"x,]}\"").unwrap().is_empty());
        let first = scanner.feed(b"}, {\"b\": [1, {\"c\": 2}]").unwrap();
        assert_eq!(first, vec![json!({"a": "x,]}"})]);
        let second = scanner.feed(b"}\n]").unwrap();
        assert_eq!(second, vec![json!({"b": [1, {"c": 2}]})]);
        scanner.finish().unwrap();
    }

    #[test]
    fn scanner_handles_escaped_quotes_and_scalars() {
        let mut scanner = ArrayScanner::new();
        let values = scanner.feed(br#"[ {"t": "say \"hi\" }"}, 7 , "s"]"#).unwrap();
        assert_eq!(values, vec![json!({"t": "say \"hi\" }"}), json!(7), json!("s")]);
        scanner.finish().unwrap();
    }

    #[test]
    fn scanner_rejects_non_array_body() {
        let mut scanner = ArrayScanner::new();
        assert!(matches!(
            scanner.feed(br#"{"error": "x"}"#),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn scanner_reports_truncated_body() {
        let mut scanner = ArrayScanner::new();
        scanner.feed(b"[{\"a\": 1},").unwrap();
        assert!(scanner.finish().is_err());
        assert!(ArrayScanner::new().finish().is_err());
    }

    #[test]
    fn empty_array_is_fine() {
        let mut scanner = ArrayScanner::new();
        assert!(scanner.feed(b" [ ] ").unwrap().is_empty());
        scanner.finish().unwrap();
    }

    #[tokio::test]
    async fn byte_at_a_time_yields_system_messages_in_order() {
        let body = r#"[{"userMessage": {"text": "q"}},
            {"systemMessage": {"text": {"parts": ["hi"]}}},
            {"systemMessage": {"schema": {"result": {}}}},
            {"systemMessage": {"data": {"result": {"sql": "SELECT \"x\""}}}}]"#;
        let stream = futures::stream::iter(body_in_pieces(body, 1));
        let chunks: Vec<_> = message_chunks(stream, CancellationToken::new())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        let kinds: Vec<_> = chunks.iter().map(RawChunk::kind).collect();
        assert_eq!(kinds, vec!["text", "schema", "data"]);
    }

    #[tokio::test]
    async fn chunk_is_yielded_before_body_ends() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Vec<u8>, String>>();
        let body = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        let mut chunks = message_chunks(body, CancellationToken::new());

        tx.send(Ok(br#"[{"systemMessage": {"text": "early"}},"#.to_vec()))
            .unwrap();
        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.kind(), "text");

        tx.send(Ok(b"{\"systemMessage\": {\"text\": \"late\"}}]".to_vec()))
            .unwrap();
        drop(tx);
        assert!(chunks.next().await.unwrap().is_ok());
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let body = futures::stream::iter(vec![
            Ok(b"[{\"systemMessage\": {\"text\": \"a\"}},".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let items: Vec<_> = message_chunks(body, CancellationToken::new()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(GatewayError::NetworkError(ref m)) if m == "connection reset"));
    }

    #[tokio::test]
    async fn cancellation_ends_stream() {
        let cancel = CancellationToken::new();
        let body = futures::stream::pending::<Result<Vec<u8>, String>>();
        let mut chunks = message_chunks(body, cancel.clone());
        cancel.cancel();
        assert!(matches!(chunks.next().await, Some(Err(GatewayError::Cancelled))));
        assert!(chunks.next().await.is_none());
    }
}
