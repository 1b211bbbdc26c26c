//! Error types for the EventDelta streaming client

use std::fmt;

/// Errors that can occur while issuing, intercepting or reading streamed responses
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Connectivity failures, short buffer writes, exhausted reconnection
    Transport(TransportError),
    /// The response is not the event stream that was asked for
    Protocol(ProtocolError),
    /// A 3xx/4xx/5xx status surfaced by a convenience accessor
    Status(StatusError),
    /// Buffered body could not be decoded
    Decode(DecodeError),
    /// The API was used in a way it does not support
    Usage(UsageError),
}

/// Transport-level error details
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub error_type: TransportErrorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorType {
    Timeout,
    ConnectionFailed,
    ConnectionLost,
    BufferWrite,
    ReconnectExhausted,
    Other,
}

/// Event stream protocol error details
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub message: String,
    pub content_type: Option<String>,
    pub url: String,
}

/// HTTP status error details
#[derive(Debug, Clone)]
pub struct StatusError {
    pub status_code: u16,
    pub url: String,
    pub class: StatusClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Redirection,
    Client,
    Server,
}

/// Body decoding error details
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub message: String,
    pub error_type: DecodeErrorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorType {
    JsonParsing,
    ContentType,
    NotContainer,
    InvalidUtf8,
}

/// API misuse details
#[derive(Debug, Clone)]
pub struct UsageError {
    pub message: String,
}

impl ClientError {
    /// Create a transport error of the given type
    pub fn transport(message: impl Into<String>, error_type: TransportErrorType) -> Self {
        Self::Transport(TransportError {
            message: message.into(),
            error_type,
        })
    }

    /// Create an idle timeout transport error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transport(message, TransportErrorType::Timeout)
    }

    /// Create a connection-lost transport error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::transport(message, TransportErrorType::ConnectionLost)
    }

    /// Create the error raised when a content sink accepts fewer bytes than offered
    pub fn buffer_write(len: usize) -> Self {
        Self::transport(
            format!("Failed writing {len} bytes to the response buffer."),
            TransportErrorType::BufferWrite,
        )
    }

    /// Create a protocol error for an unexpected response content-type
    pub fn protocol(content_type: Option<&str>, url: &str) -> Self {
        Self::Protocol(ProtocolError {
            message: format!(
                "Response content-type is \"{}\" while \"text/event-stream\" was expected for \"{}\".",
                content_type.unwrap_or_default(),
                url
            ),
            content_type: content_type.map(str::to_string),
            url: url.to_string(),
        })
    }

    /// Classify a status code, returning `None` below 300
    pub fn status(status_code: u16, url: &str) -> Option<Self> {
        let class = match status_code {
            500..=u16::MAX => StatusClass::Server,
            400..=499 => StatusClass::Client,
            300..=399 => StatusClass::Redirection,
            _ => return None,
        };

        Some(Self::Status(StatusError {
            status_code,
            url: url.to_string(),
            class,
        }))
    }

    /// Create a body decoding error
    pub fn decode(message: impl Into<String>, error_type: DecodeErrorType) -> Self {
        Self::Decode(DecodeError {
            message: message.into(),
            error_type,
        })
    }

    /// Create a usage error
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(UsageError {
            message: message.into(),
        })
    }

    /// Whether this is a transport error
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether this is an idle timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError {
                error_type: TransportErrorType::Timeout,
                ..
            })
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(err) => write!(f, "Transport error: {}", err.message),
            ClientError::Protocol(err) => write!(f, "Protocol error: {}", err.message),
            ClientError::Status(err) => {
                write!(f, "HTTP {} returned for \"{}\"", err.status_code, err.url)
            }
            ClientError::Decode(err) => write!(f, "Decode error: {}", err.message),
            ClientError::Usage(err) => write!(f, "Usage error: {}", err.message),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.as_str()).unwrap_or("unknown");

        if err.is_timeout() {
            ClientError::timeout(format!("Idle timeout reached for \"{url}\"."))
        } else if err.is_connect() {
            let host = err
                .url()
                .and_then(|u| u.host_str())
                .unwrap_or("unknown host");
            ClientError::transport(
                format!("Failed to connect to {host}: {err}"),
                TransportErrorType::ConnectionFailed,
            )
        } else if err.is_body() || err.is_decode() {
            ClientError::connection_lost(format!("Body stream broke for \"{url}\": {err}"))
        } else {
            ClientError::transport(err.to_string(), TransportErrorType::Other)
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::decode(
            format!("JSON parsing failed: {err}"),
            DecodeErrorType::JsonParsing,
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::transport(
            format!("Response buffer I/O failed: {err}"),
            TransportErrorType::BufferWrite,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(ClientError::status(204, "http://x").is_none());

        match ClientError::status(302, "http://x") {
            Some(ClientError::Status(err)) => assert_eq!(err.class, StatusClass::Redirection),
            other => panic!("unexpected: {other:?}"),
        }
        match ClientError::status(404, "http://x") {
            Some(ClientError::Status(err)) => assert_eq!(err.class, StatusClass::Client),
            other => panic!("unexpected: {other:?}"),
        }
        match ClientError::status(503, "http://x") {
            Some(ClientError::Status(err)) => assert_eq!(err.class, StatusClass::Server),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_protocol_message() {
        let err = ClientError::protocol(Some("text/html"), "http://localhost/events");
        assert_eq!(
            err.to_string(),
            "Protocol error: Response content-type is \"text/html\" while \"text/event-stream\" was expected for \"http://localhost/events\"."
        );
    }

    #[test]
    fn test_timeout_predicate() {
        assert!(ClientError::timeout("idle").is_timeout());
        assert!(ClientError::timeout("idle").is_transport());
        assert!(!ClientError::connection_lost("gone").is_timeout());
        assert!(!ClientError::usage("nope").is_transport());
    }
}
