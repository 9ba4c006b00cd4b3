//! Inbound byte stream adapter.

use std::error::Error as StdError;
use std::io;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Error text produced by the HTTP stack when the peer hangs up mid-body.
const CLOSED_MARKERS: &[&str] = &[
    "connection closed before message completed",
    "incomplete stream",
    "incomplete field data",
    "incomplete headers",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl IngestError {
    /// Walk the source chain and decide whether the error means the caller went away.
    pub fn classify(err: &(dyn StdError + 'static)) -> Self {
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) {
                    return IngestError::Closed(err.to_string());
                }
            }
            let msg = e.to_string().to_lowercase();
            if CLOSED_MARKERS.iter().any(|marker| msg.contains(marker)) {
                return IngestError::Closed(err.to_string());
            }
            current = e.source();
        }
        IngestError::Transport(err.to_string())
    }
}

/// One step of the inbound sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Chunk(Bytes),
    EndOfInput,
    /// Abrupt close by the caller.
    Closed,
    TransportError(IngestError),
}

impl IngestEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IngestEvent::Chunk(_))
    }
}

/// Lazy, finite, non-restartable sequence of inbound chunks.
///
/// The `disconnect` token is cancelled by the HTTP layer when the connection
/// goes away; it only matters while the stream itself has nothing ready.
pub struct ByteSource {
    stream: BoxStream<'static, Result<Bytes, IngestError>>,
    disconnect: CancellationToken,
    terminal: Option<IngestEvent>,
    bytes_read: u64,
}

impl ByteSource {
    pub fn new<S, E>(stream: S, disconnect: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let stream = stream.map(|item| item.map_err(|e| IngestError::classify(&e)));
        Self::from_classified(stream, disconnect)
    }

    /// Build from a stream whose errors are already classified.
    pub fn from_classified<S>(stream: S, disconnect: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes, IngestError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            disconnect,
            terminal: None,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Token the HTTP layer cancels when the connection goes away.
    pub fn disconnect_token(&self) -> &CancellationToken {
        &self.disconnect
    }

    /// Next chunk or terminal signal. Once a terminal signal was returned it is
    /// returned again on every later call.
    pub async fn next_event(&mut self) -> IngestEvent {
        if let Some(terminal) = &self.terminal {
            return terminal.clone();
        }

        let event = loop {
            let event = tokio::select! {
                biased;
                item = self.stream.next() => match item {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => IngestEvent::Chunk(chunk),
                    Some(Err(IngestError::Closed(reason))) => {
                        tracing::debug!(reason = %reason, "Inbound stream closed by peer");
                        IngestEvent::Closed
                    }
                    Some(Err(err)) => IngestEvent::TransportError(err),
                    None => IngestEvent::EndOfInput,
                },
                _ = self.disconnect.cancelled() => IngestEvent::Closed,
            };
            break event;
        };

        match &event {
            IngestEvent::Chunk(chunk) => self.bytes_read += chunk.len() as u64,
            terminal => self.terminal = Some(terminal.clone()),
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn ok(data: &'static [u8]) -> Result<Bytes, io::Error> {
        Ok(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_chunks_then_end_of_input() {
        let mut source = ByteSource::new(
            stream::iter(vec![ok(b"ab"), ok(b""), ok(b"cd")]),
            CancellationToken::new(),
        );
        assert_eq!(source.next_event().await, IngestEvent::Chunk(Bytes::from_static(b"ab")));
        assert_eq!(source.next_event().await, IngestEvent::Chunk(Bytes::from_static(b"cd")));
        assert_eq!(source.next_event().await, IngestEvent::EndOfInput);
        assert_eq!(source.bytes_read(), 4);
    }

    #[tokio::test]
    async fn test_end_of_input_is_sticky_after_disconnect() {
        let token = CancellationToken::new();
        let mut source = ByteSource::new(stream::iter(vec![ok(b"x")]), token.clone());
        source.next_event().await;
        assert_eq!(source.next_event().await, IngestEvent::EndOfInput);
        token.cancel();
        assert_eq!(source.next_event().await, IngestEvent::EndOfInput);
    }

    #[tokio::test]
    async fn test_reset_is_closed() {
        let items = vec![
            ok(b"x"),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ];
        let mut source = ByteSource::new(stream::iter(items), CancellationToken::new());
        source.next_event().await;
        assert_eq!(source.next_event().await, IngestEvent::Closed);
    }

    #[tokio::test]
    async fn test_incomplete_message_text_is_closed() {
        let err = io::Error::other("error reading a body from connection: connection closed before message completed");
        assert!(matches!(IngestError::classify(&err), IngestError::Closed(_)));
    }

    #[tokio::test]
    async fn test_other_errors_are_transport_errors() {
        let items = vec![Err(io::Error::new(io::ErrorKind::InvalidData, "bad chunk header"))];
        let mut source = ByteSource::new(stream::iter(items), CancellationToken::new());
        assert!(matches!(
            source.next_event().await,
            IngestEvent::TransportError(IngestError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting_is_closed() {
        let token = CancellationToken::new();
        let body = stream::iter(vec![ok(b"first")]).chain(stream::pending());
        let mut source = ByteSource::new(body, token.clone());
        assert!(matches!(source.next_event().await, IngestEvent::Chunk(_)));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert_eq!(source.next_event().await, IngestEvent::Closed);
    }
}
