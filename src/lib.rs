//! # EventDelta
//!
//! A streaming HTTP client extension: Server-Sent Events with automatic
//! reconnection, built on a general mechanism for intercepting a response
//! body chunk by chunk.
//!
//! - [`decorator`] wraps responses with an [`Interceptor`] that can observe,
//!   rewrite, splice or replace the underlying request mid-stream, and drives
//!   many such responses concurrently with [`stream`].
//! - [`sse`] parses event streams into [`Message`]s and reconnects broken
//!   streams with `Last-Event-ID`.
//! - [`BufferedResponse`] reads a decorated response as a whole.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventdelta::{EventSourceClient, HttpConfig, Request};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     eventdelta::init_tracing();
//!
//!     let client = EventSourceClient::http(&HttpConfig::for_event_stream())?;
//!     let mut response = client.connect(Request::get("https://example.com/events"));
//!
//!     let mut messages = client.messages(&mut response);
//!     while let Some(message) = messages.next().await {
//!         let message = message?;
//!         println!("{}: {}", message.event(), message.data());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod buffered;
pub mod chunk;
pub mod decorator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod observability;
pub mod sse;
pub mod transport;

pub use buffered::BufferedResponse;
pub use chunk::{Chunk, StreamEvent};
pub use decorator::{
    intercept_fn, stream, Buffering, ContentSink, DecoratedResponse, Intercepted, Interceptor,
    InterceptorContext, ResponseId,
};
pub use error::*;
pub use http::{HttpConfig, HttpTransport};
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use observability::init_tracing;
pub use sse::{EventSourceClient, EventSourceConfig, Message};
pub use transport::{PhysicalResponse, Request, ResponseInfo, Transport};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockResponse, MockTransport};
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_event_stream_end_to_end() {
        let transport = Arc::new(MockTransport::new([MockResponse::event_stream()
            .body("id: 1\ndata: hel")
            .body("lo\n\nevent: done\ndata: bye\n\n")
            .stall()]));
        let client = EventSourceClient::new(transport);
        let mut response = client.connect(Request::get("http://localhost/events"));

        let messages: Vec<_> = client.messages(&mut response).take(2).collect().await;
        let messages: Vec<Message> = messages.into_iter().map(Result::unwrap).collect();

        assert_eq!(messages[0], Message::new("hello").with_id("1"));
        assert_eq!(messages[1].event(), "done");
        assert_eq!(response.info("last_event_id"), Some("1".into()));
        assert_eq!(client.metrics().get_stats().messages_parsed, 2);
    }
}
