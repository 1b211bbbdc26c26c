//! Chunks flowing from transports through interceptors to callers

use bytes::Bytes;

use crate::sse::Message;
use crate::ClientError;

/// One increment of a streamed response
///
/// A physical response produces `First`, then any number of `Data`, then
/// either `Last` or `Error`. `Timeout` is synthesised by the driver when no
/// chunk arrived in time.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Status line and headers have arrived
    First,
    /// A slice of the response body
    Data(Bytes),
    /// The body is complete
    Last,
    /// Nothing arrived within the driver's idle timeout
    Timeout,
    /// The response failed
    Error(ClientError),
}

impl Chunk {
    pub fn is_first(&self) -> bool {
        matches!(self, Chunk::First)
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Chunk::Last)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Chunk::Timeout)
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            Chunk::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Body bytes carried by this chunk, empty for anything but `Data`
    pub fn content(&self) -> &[u8] {
        match self {
            Chunk::Data(bytes) => bytes,
            _ => &[],
        }
    }
}

/// A value yielded by an interceptor and republished to the caller
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(Chunk),
    Message(Message),
}

impl StreamEvent {
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            StreamEvent::Chunk(chunk) => Some(chunk),
            StreamEvent::Message(_) => None,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            StreamEvent::Message(message) => Some(message),
            StreamEvent::Chunk(_) => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            StreamEvent::Message(message) => Some(message),
            StreamEvent::Chunk(_) => None,
        }
    }

    pub fn is_first(&self) -> bool {
        self.chunk().map_or(false, Chunk::is_first)
    }

    pub fn is_last(&self) -> bool {
        self.chunk().map_or(false, Chunk::is_last)
    }

    pub fn is_timeout(&self) -> bool {
        self.chunk().map_or(false, Chunk::is_timeout)
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.chunk().and_then(Chunk::error)
    }
}

impl From<Chunk> for StreamEvent {
    fn from(chunk: Chunk) -> Self {
        StreamEvent::Chunk(chunk)
    }
}

impl From<Message> for StreamEvent {
    fn from(message: Message) -> Self {
        StreamEvent::Message(message)
    }
}
