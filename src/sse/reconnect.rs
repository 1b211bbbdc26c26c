//! The Server-Sent Events reconnection state machine
//!
//! [`ReconnectionController`] is an [`Interceptor`]: it parses event stream
//! bodies into [`Message`]s and, when an established stream breaks, replaces
//! the underlying request with one carrying `Last-Event-ID` after waiting
//! the reconnection time. Callers keep iterating the same response.

use bytes::{Buf, BytesMut};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::parser::{parse, BOM};
use super::Message;
use crate::decorator::{Intercepted, Interceptor, InterceptorContext};
use crate::metrics::StreamMetrics;
use crate::transport::Request;
use crate::{Chunk, ClientError, StreamEvent, TransportErrorType};

pub const EVENT_STREAM: &str = "text/event-stream";
pub const LAST_EVENT_ID: &str = "last-event-id";

/// Per-connection state that survives reconnections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    /// Id of the last message that carried a non-empty one
    pub last_event_id: Option<String>,
    /// Delay before a new attempt, updated by `retry` fields
    pub reconnection_time: Duration,
    /// Start of the current run of failures
    pub last_error_at: Option<Instant>,
}

impl StreamState {
    pub fn new(reconnection_time: Duration) -> Self {
        Self {
            last_event_id: None,
            reconnection_time,
            last_error_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the headers of the first attempt
    FirstChunkPending,
    /// Parsing an event stream body
    Streaming,
    /// A replacement request is pending
    Reconnecting,
    /// Nothing more will be parsed
    Closed,
}

/// Turns event stream responses into messages and recovers broken streams
pub struct ReconnectionController {
    request: Request,
    state: StreamState,
    phase: Phase,
    buffer: BytesMut,
    event_stream_required: bool,
    bom_pending: bool,
    attempts: u32,
    max_attempts: Option<u32>,
    metrics: StreamMetrics,
}

impl std::fmt::Debug for ReconnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionController")
            .field("url", &self.request.url)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl ReconnectionController {
    /// Control the response to `request`
    ///
    /// `request` is kept so it can be re-issued. A stream is required when its
    /// `Accept` header is exactly `text/event-stream`; anything else falls back
    /// to passing the response through when the server does not answer with an
    /// event stream.
    pub fn new(request: Request, reconnection_time: Duration) -> Self {
        let event_stream_required = request
            .headers
            .get(ACCEPT)
            .map_or(false, |accept| accept.as_bytes() == EVENT_STREAM.as_bytes());

        Self {
            request,
            state: StreamState::new(reconnection_time),
            phase: Phase::FirstChunkPending,
            buffer: BytesMut::new(),
            event_stream_required,
            bom_pending: true,
            attempts: 0,
            max_attempts: None,
            metrics: StreamMetrics::new(),
        }
    }

    /// Give up after `max` consecutive failed reconnections
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn on_first(&mut self, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        let is_event_stream = ctx
            .content_type()
            .map_or(false, |content_type| content_type.starts_with(EVENT_STREAM));
        let reconnecting = self.phase == Phase::Reconnecting;

        if is_event_stream {
            self.phase = Phase::Streaming;
            self.buffer.clear();
            self.bom_pending = true;
            self.attempts = 0;
            self.state.last_error_at = None;

            if reconnecting {
                self.metrics.record_reconnection();
                info!(
                    url = %ctx.url(),
                    last_event_id = ?self.state.last_event_id,
                    "event stream reconnected"
                );
                return Ok(vec![]);
            }
            debug!(url = %ctx.url(), "event stream opened");
            return Ok(vec![Chunk::First.into()]);
        }

        if reconnecting && ctx.status() == Some(StatusCode::NO_CONTENT) {
            info!(url = %ctx.url(), "server asked to stop reconnecting");
            self.phase = Phase::Closed;
            ctx.passthrough(None);
            return Ok(vec![]);
        }

        if reconnecting || (self.event_stream_required && ctx.status() == Some(StatusCode::OK)) {
            self.phase = Phase::Closed;
            return Err(ClientError::protocol(ctx.content_type(), ctx.url()));
        }

        debug!(url = %ctx.url(), content_type = ?ctx.content_type(), "not an event stream, passing through");
        self.phase = Phase::Closed;
        ctx.passthrough(None);
        Ok(vec![Chunk::First.into()])
    }

    fn on_data(&mut self, data: &[u8], ctx: &mut InterceptorContext<'_>) -> Intercepted {
        self.metrics.record_chunk(data.len());
        self.buffer.extend_from_slice(data);

        if self.bom_pending {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return Ok(vec![]);
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.bom_pending = false;
        }

        let (messages, rest) = parse(&self.buffer);
        let consumed = self.buffer.len() - rest.len();
        self.buffer.advance(consumed);
        self.state.last_error_at = None;

        for message in &messages {
            self.track(message, ctx);
        }
        self.metrics.record_messages(messages.len());

        Ok(messages.into_iter().map(StreamEvent::from).collect())
    }

    fn track(&mut self, message: &Message, ctx: &mut InterceptorContext<'_>) {
        if let Some(id) = message.id() {
            self.state.last_event_id = Some(id.to_string());
            ctx.set_info("last_event_id", id);
        }
        if let Some(retry) = message.retry() {
            self.state.reconnection_time = retry;
            ctx.set_info("reconnection_time", retry.as_secs_f64());
        }
    }

    fn on_last(&mut self, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        if self.phase == Phase::Streaming && !ctx.is_canceled() {
            let cause = ClientError::connection_lost(format!(
                "Server closed the event stream of \"{}\".",
                ctx.url()
            ));
            return self.reconnect(cause, ctx);
        }

        self.phase = Phase::Closed;
        Ok(vec![Chunk::Last.into()])
    }

    fn on_failure(&mut self, chunk: Chunk, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        let now = Instant::now();
        let since = *self.state.last_error_at.get_or_insert(now);
        let established = matches!(self.phase, Phase::Streaming | Phase::Reconnecting);

        let forward = match &chunk {
            Chunk::Timeout => !established || now.duration_since(since) < self.state.reconnection_time,
            _ => !established,
        };
        if forward {
            if chunk.error().is_some() {
                self.phase = Phase::Closed;
            }
            return Ok(vec![chunk.into()]);
        }

        let cause = match chunk {
            Chunk::Error(err) => err,
            _ => ClientError::timeout(format!(
                "Idle timeout reached for \"{}\" after {:?}.",
                ctx.url(),
                now.duration_since(since)
            )),
        };
        self.reconnect(cause, ctx)
    }

    fn reconnect(&mut self, cause: ClientError, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        self.metrics.record_error();
        self.attempts += 1;

        if let Some(max) = self.max_attempts {
            if self.attempts > max {
                self.phase = Phase::Closed;
                return Err(ClientError::transport(
                    format!(
                        "Gave up reconnecting to \"{}\" after {} attempts: {}",
                        ctx.url(),
                        max,
                        cause
                    ),
                    TransportErrorType::ReconnectExhausted,
                ));
            }
        }

        let mut request = self.request.clone();
        if let Some(value) = self
            .state
            .last_event_id
            .as_deref()
            .and_then(|id| HeaderValue::from_str(id).ok())
        {
            request
                .headers
                .insert(HeaderName::from_static(LAST_EVENT_ID), value);
        }

        warn!(
            url = %request.url,
            attempt = self.attempts,
            delay_ms = self.state.reconnection_time.as_millis() as u64,
            last_event_id = ?self.state.last_event_id,
            error = %cause,
            "event stream interrupted, reconnecting"
        );

        self.buffer.clear();
        self.state.last_error_at = Some(Instant::now());
        self.phase = Phase::Reconnecting;
        ctx.replace_request(&request);
        ctx.pause(self.state.reconnection_time);

        Ok(vec![])
    }
}

impl Interceptor for ReconnectionController {
    fn intercept(&mut self, chunk: Chunk, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        if self.phase != Phase::Closed {
            ctx.set_info("reconnection_time", self.state.reconnection_time.as_secs_f64());
        }

        match chunk {
            Chunk::First => self.on_first(ctx),
            Chunk::Data(bytes) if self.phase == Phase::Streaming => self.on_data(&bytes, ctx),
            Chunk::Data(bytes) => Ok(vec![Chunk::Data(bytes).into()]),
            Chunk::Last => self.on_last(ctx),
            chunk @ (Chunk::Timeout | Chunk::Error(_)) => self.on_failure(chunk, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_stream_detection() {
        let required = Request::get("http://localhost/events")
            .try_header("accept", EVENT_STREAM)
            .unwrap();
        assert!(ReconnectionController::new(required, Duration::from_secs(2)).event_stream_required);

        let optional = Request::get("http://localhost/events")
            .try_header("accept", "text/event-stream, application/json")
            .unwrap();
        assert!(!ReconnectionController::new(optional, Duration::from_secs(2)).event_stream_required);
    }

    #[test]
    fn test_initial_state() {
        let controller =
            ReconnectionController::new(Request::get("http://localhost/"), Duration::from_millis(500));
        assert_eq!(controller.phase(), Phase::FirstChunkPending);
        assert_eq!(controller.state(), &StreamState::new(Duration::from_millis(500)));
    }
}
