//! EventSource-style client built on the decorator

use futures::ready;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use pin_project_lite::pin_project;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::reconnect::{ReconnectionController, EVENT_STREAM};
use super::Message;
use crate::decorator::{self, Buffering, DecoratedResponse, ResponseId};
use crate::http::{HttpConfig, HttpTransport};
use crate::metrics::StreamMetrics;
use crate::transport::{Request, Transport};
use crate::{Chunk, ClientError, StreamEvent};

/// Settings shared by every connection of an [`EventSourceClient`]
#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    /// Delay before reconnecting, until the server sends `retry`
    pub reconnection_time: Duration,
    /// Consecutive failed reconnections tolerated; unlimited when `None`
    pub max_reconnect_attempts: Option<u32>,
    /// Idle timeout handed to the driver
    pub idle_timeout: Option<Duration>,
    /// Sent with every request, overriding the event stream defaults
    pub headers: HeaderMap,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            reconnection_time: Duration::from_secs(2),
            max_reconnect_attempts: None,
            idle_timeout: None,
            headers: HeaderMap::new(),
        }
    }
}

impl EventSourceConfig {
    pub fn builder() -> EventSourceConfigBuilder {
        EventSourceConfigBuilder::default()
    }
}

/// Builder for [`EventSourceConfig`]
#[derive(Debug, Default)]
pub struct EventSourceConfigBuilder {
    config: EventSourceConfig,
}

impl EventSourceConfigBuilder {
    pub fn reconnection_time(mut self, delay: Duration) -> Self {
        self.config.reconnection_time = delay;
        self
    }

    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.config.max_reconnect_attempts = Some(max);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn build(self) -> EventSourceConfig {
        self.config
    }
}

/// Opens event streams that survive disconnections
///
/// ```rust,no_run
/// use eventdelta::{EventSourceClient, HttpConfig, Request};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), eventdelta::ClientError> {
/// let client = EventSourceClient::http(&HttpConfig::for_event_stream())?;
/// let mut response = client.connect(Request::get("https://example.com/events"));
///
/// let mut messages = client.messages(&mut response);
/// while let Some(message) = messages.next().await {
///     println!("{}", message?);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventSourceClient {
    transport: Arc<dyn Transport>,
    config: EventSourceConfig,
    metrics: StreamMetrics,
}

impl std::fmt::Debug for EventSourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceClient")
            .field("config", &self.config)
            .finish()
    }
}

impl EventSourceClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, EventSourceConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: EventSourceConfig) -> Self {
        Self {
            transport,
            config,
            metrics: StreamMetrics::new(),
        }
    }

    /// Client over a fresh reqwest transport
    pub fn http(config: &HttpConfig) -> Result<Self, ClientError> {
        Ok(Self::new(Arc::new(HttpTransport::from_config(config)?)))
    }

    pub fn config(&self) -> &EventSourceConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Counters shared by every connection opened through this client
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    /// Open an event stream
    ///
    /// `Accept: text/event-stream` and `Cache-Control: no-cache` are added
    /// unless the request sets them. The body is not buffered.
    pub fn connect(&self, request: Request) -> DecoratedResponse {
        let request = self.prepare(request, true);
        self.decorate(request, Buffering::Disabled)
    }

    /// Send an arbitrary request, parsing the body only if the server answers with an event stream
    pub fn request(&self, request: Request, buffering: impl Into<Buffering>) -> DecoratedResponse {
        let request = self.prepare(request, false);
        self.decorate(request, buffering.into())
    }

    /// Drive responses opened by this client, applying the configured idle timeout
    pub fn stream<'a>(
        &self,
        responses: &'a mut [DecoratedResponse],
    ) -> Result<BoxStream<'a, (ResponseId, StreamEvent)>, ClientError> {
        decorator::stream(responses, self.config.idle_timeout)
    }

    /// Iterate the messages of one response
    ///
    /// Chunks are skipped; the sequence ends after the terminal chunk, yielding
    /// the error if there was one. Dropping it early and calling `messages`
    /// again resumes where it stopped.
    pub fn messages<'a>(&self, response: &'a mut DecoratedResponse) -> Messages<'a> {
        let id = response.id();
        let inner = decorator::stream(std::slice::from_mut(response), self.config.idle_timeout)
            .unwrap_or_else(|err| stream::iter([(id, StreamEvent::from(Chunk::Error(err)))]).boxed());

        Messages { inner, done: false }
    }

    fn decorate(&self, request: Request, buffering: Buffering) -> DecoratedResponse {
        let controller =
            ReconnectionController::new(request.clone(), self.config.reconnection_time)
                .with_max_attempts(self.config.max_reconnect_attempts)
                .with_metrics(self.metrics.clone());

        DecoratedResponse::with_buffering(self.transport.clone(), &request, controller, buffering)
    }

    fn prepare(&self, mut request: Request, event_stream: bool) -> Request {
        let mut headers = HeaderMap::new();
        if event_stream {
            headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        merge_headers(&mut headers, &self.config.headers);
        merge_headers(&mut headers, &request.headers);

        request.headers = headers;
        request
    }
}

fn merge_headers(base: &mut HeaderMap, overrides: &HeaderMap) {
    for name in overrides.keys() {
        base.remove(name);
    }
    for (name, value) in overrides {
        base.append(name.clone(), value.clone());
    }
}

pin_project! {
    /// Messages of a single decorated response, see [`EventSourceClient::messages`]
    pub struct Messages<'a> {
        #[pin]
        inner: BoxStream<'a, (ResponseId, StreamEvent)>,
        done: bool,
    }
}

impl<'a> Stream for Messages<'a> {
    type Item = Result<Message, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some((_, StreamEvent::Message(message))) => return Poll::Ready(Some(Ok(message))),
                Some((_, StreamEvent::Chunk(Chunk::Error(err)))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Some((_, StreamEvent::Chunk(Chunk::Last))) | None => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Some(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_config_builder() {
        let config = EventSourceConfig::builder()
            .reconnection_time(Duration::from_millis(250))
            .max_reconnect_attempts(3)
            .header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer token"),
            )
            .build();

        assert_eq!(config.reconnection_time, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.headers["authorization"], "Bearer token");
        assert_eq!(
            EventSourceConfig::default().reconnection_time,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_connect_headers_merge() {
        let config = EventSourceConfig::builder()
            .header(CACHE_CONTROL, HeaderValue::from_static("max-age=0"))
            .build();
        let client = EventSourceClient::with_config(Arc::new(MockTransport::default()), config);

        let request = Request::get("http://localhost/events")
            .try_header("accept", "text/event-stream, */*")
            .unwrap();
        let request = client.prepare(request, true);

        assert_eq!(request.headers[ACCEPT], "text/event-stream, */*");
        assert_eq!(request.headers[CACHE_CONTROL], "max-age=0");
    }

    #[test]
    fn test_plain_request_gets_no_event_stream_defaults() {
        let client = EventSourceClient::new(Arc::new(MockTransport::default()));
        let request = client.prepare(Request::get("http://localhost/"), false);
        assert!(request.headers.get(ACCEPT).is_none());
    }
}
