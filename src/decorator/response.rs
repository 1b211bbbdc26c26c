use bytes::Bytes;
use futures::ready;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Sleep;
use tracing::{debug, warn};

use super::{intercept_fn, Buffering, ContentSink, Intercepted, Interceptor, InterceptorContext};
use crate::transport::{PhysicalResponse, Request, ResponseInfo, Transport};
use crate::{Chunk, ClientError, StreamEvent};

static NEXT_RESPONSE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a decorated response across every physical request it makes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseId(u64);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response#{}", self.0)
    }
}

pub(crate) enum Handler {
    Intercept(Box<dyn Interceptor>),
    /// Chunks are republished untouched
    Raw,
    /// The interceptor is being invoked
    Detached,
}

/// A logical response whose chunks pass through an [`Interceptor`]
///
/// The underlying physical response can be replaced any number of times; the
/// caller keeps seeing a single response with one identity.
pub struct DecoratedResponse {
    id: ResponseId,
    transport: Arc<dyn Transport>,
    pub(crate) current: PhysicalResponse,
    handler: Handler,
    pub(crate) next_handler: Option<Handler>,
    pub(crate) custom_info: HashMap<String, Value>,
    pub(crate) previous_info: Vec<ResponseInfo>,
    buffering: Option<Buffering>,
    sink: Option<Box<dyn ContentSink>>,
    offset: u64,
    queue: VecDeque<StreamEvent>,
    pub(crate) pause: Option<Pin<Box<Sleep>>>,
    error: Option<ClientError>,
    terminal: Option<Chunk>,
    finished: bool,
}

impl fmt::Debug for DecoratedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratedResponse")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("offset", &self.offset)
            .field("finished", &self.finished)
            .field("error", &self.error)
            .finish()
    }
}

/// Builder for [`DecoratedResponse`]
pub struct DecoratedResponseBuilder {
    transport: Arc<dyn Transport>,
    request: Request,
    handler: Option<Handler>,
    buffering: Buffering,
}

impl DecoratedResponseBuilder {
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.handler = Some(Handler::Intercept(Box::new(interceptor)));
        self
    }

    /// Republish chunks untouched
    pub fn passthrough(mut self) -> Self {
        self.handler = Some(Handler::Raw);
        self
    }

    pub fn buffering(mut self, buffering: impl Into<Buffering>) -> Self {
        self.buffering = buffering.into();
        self
    }

    /// Issue the request and wrap it
    pub fn build(self) -> Result<DecoratedResponse, ClientError> {
        let handler = self.handler.ok_or_else(|| {
            ClientError::usage(format!(
                "No interceptor configured for \"{}\": call interceptor() or passthrough().",
                self.request.url
            ))
        })?;

        Ok(DecoratedResponse::from_parts(
            self.transport,
            &self.request,
            handler,
            self.buffering,
        ))
    }
}

impl DecoratedResponse {
    pub fn builder(transport: Arc<dyn Transport>, request: Request) -> DecoratedResponseBuilder {
        DecoratedResponseBuilder {
            transport,
            request,
            handler: None,
            buffering: Buffering::default(),
        }
    }

    /// Issue `request` and route its chunks through `interceptor`, buffering the body
    pub fn new(
        transport: Arc<dyn Transport>,
        request: Request,
        interceptor: impl Interceptor + 'static,
    ) -> Self {
        Self::from_parts(
            transport,
            &request,
            Handler::Intercept(Box::new(interceptor)),
            Buffering::default(),
        )
    }

    pub(crate) fn with_buffering(
        transport: Arc<dyn Transport>,
        request: &Request,
        interceptor: impl Interceptor + 'static,
        buffering: Buffering,
    ) -> Self {
        Self::from_parts(
            transport,
            request,
            Handler::Intercept(Box::new(interceptor)),
            buffering,
        )
    }

    /// Shorthand for a closure interceptor
    pub fn with_fn<F>(transport: Arc<dyn Transport>, request: Request, f: F) -> Self
    where
        F: FnMut(Chunk, &mut InterceptorContext<'_>) -> Intercepted + Send + 'static,
    {
        Self::new(transport, request, intercept_fn(f))
    }

    fn from_parts(
        transport: Arc<dyn Transport>,
        request: &Request,
        handler: Handler,
        buffering: Buffering,
    ) -> Self {
        let current = PhysicalResponse::issue(transport.as_ref(), request);
        let id = ResponseId(NEXT_RESPONSE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(response = %id, physical = current.id(), "decorated response created");

        Self {
            id,
            transport,
            current,
            handler,
            next_handler: None,
            custom_info: HashMap::new(),
            previous_info: Vec::new(),
            buffering: Some(buffering),
            sink: None,
            offset: 0,
            queue: VecDeque::new(),
            pause: None,
            error: None,
            terminal: None,
            finished: false,
        }
    }

    pub fn id(&self) -> ResponseId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Status of the current physical response, once its headers arrived
    pub fn status(&self) -> Option<StatusCode> {
        self.current.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.current.headers()
    }

    pub fn url(&self) -> &str {
        &self.current.info().url
    }

    pub fn method(&self) -> &Method {
        &self.current.info().method
    }

    /// Number of body bytes published to callers so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Look up an info entry
    ///
    /// Values set by interceptors win over the built-in keys: `url`,
    /// `http_method`, `http_code`, `canceled`, `error` and `previous_info`.
    pub fn info(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.custom_info.get(key) {
            return Some(value.clone());
        }

        let info = self.current.info();
        match key {
            "url" => Some(Value::from(info.url.as_str())),
            "http_method" => Some(Value::from(info.method.as_str())),
            "http_code" => info.status.map(|status| Value::from(status.as_u16())),
            "canceled" => Some(Value::from(info.canceled)),
            "error" => self
                .error
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| info.error.clone())
                .map(Value::from),
            "previous_info" => Some(Value::Array(
                self.previous_info.iter().map(ResponseInfo::to_json).collect(),
            )),
            _ => None,
        }
    }

    /// Info of every physical response this one replaced, oldest first
    pub fn previous_info(&self) -> &[ResponseInfo] {
        &self.previous_info
    }

    /// The error that ended this response, if any
    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    pub fn is_canceled(&self) -> bool {
        self.current.is_canceled()
    }

    /// Whether the response has produced its terminal chunk
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Cancel the current physical response
    ///
    /// Interceptors still see a final `Last` chunk, so they can clean up.
    pub fn cancel(&mut self) {
        self.pause = None;
        self.current.cancel();
    }

    /// Whether body bytes are being copied somewhere they can be read back
    pub(crate) fn is_buffered(&self) -> bool {
        self.sink.is_some()
    }

    /// Whether the buffering policy has been applied yet
    pub(crate) fn buffering_resolved(&self) -> bool {
        self.buffering.is_none()
    }

    /// Read the whole buffered body back, leaving the sink positioned at its end
    pub(crate) fn read_buffer(&mut self) -> Result<Option<Bytes>, ClientError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(None);
        };

        let end = sink.stream_position()?;
        sink.seek(SeekFrom::Start(0))?;
        let mut content = Vec::new();
        sink.read_to_end(&mut content)?;
        sink.seek(SeekFrom::Start(end))?;

        Ok(Some(content.into()))
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.finished
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.pause.as_ref().map_or(false, |sleep| !sleep.is_elapsed())
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(crate) fn pop_event(&mut self) -> Option<StreamEvent> {
        self.queue.pop_front()
    }

    /// The terminal chunk handed out when a finished response is streamed again
    pub(crate) fn terminal(&self) -> Option<Chunk> {
        self.terminal.clone()
    }

    /// Poll the current physical response, honouring any pause in effect
    pub(crate) fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        if let Some(sleep) = self.pause.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            self.pause = None;
        }
        self.current.poll_chunk(cx)
    }

    /// Route one chunk through the interceptor and queue whatever it yields
    pub(crate) fn dispatch(&mut self, chunk: Chunk) {
        let outcome = match std::mem::replace(&mut self.handler, Handler::Detached) {
            Handler::Raw => {
                self.handler = Handler::Raw;
                Ok(vec![chunk.into()])
            }
            Handler::Intercept(mut interceptor) => {
                let outcome = interceptor.intercept(chunk, &mut InterceptorContext::new(self));
                self.handler = match self.next_handler.take() {
                    Some(next) => next,
                    None => Handler::Intercept(interceptor),
                };
                outcome
            }
            Handler::Detached => Err(ClientError::usage(
                "An interceptor cannot stream its own response.",
            )),
        };

        match outcome {
            Ok(events) => {
                for event in events {
                    if !self.publish(event) {
                        break;
                    }
                }
            }
            Err(err) => self.abort(err),
        }
    }

    /// The current physical response has nothing more to give
    pub(crate) fn on_exhausted(&mut self) {
        if self.terminal.is_none() {
            self.terminal = Some(Chunk::Last);
            self.queue.push_back(Chunk::Last.into());
        }
        self.finished = true;
        debug!(response = %self.id, offset = self.offset, "response finished");
    }

    fn publish(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Chunk(Chunk::First) => {
                let failure = self.open_buffer().err();
                self.queue.push_back(Chunk::First.into());
                if let Some(err) = failure {
                    self.abort(err);
                    return false;
                }
            }
            StreamEvent::Chunk(Chunk::Data(bytes)) => {
                if let Some(sink) = self.sink.as_mut() {
                    let written = match sink.write(&bytes) {
                        Ok(written) => written,
                        Err(err) => {
                            self.abort(err.into());
                            return false;
                        }
                    };
                    if written != bytes.len() {
                        self.abort(ClientError::buffer_write(bytes.len()));
                        return false;
                    }
                }
                self.offset += bytes.len() as u64;
                self.queue.push_back(Chunk::Data(bytes).into());
            }
            StreamEvent::Chunk(chunk @ (Chunk::Last | Chunk::Error(_))) => {
                if let Chunk::Error(err) = &chunk {
                    self.error.get_or_insert_with(|| err.clone());
                }
                self.terminal = Some(chunk.clone());
                self.queue.push_back(chunk.into());
                self.close();
                return false;
            }
            other => self.queue.push_back(other),
        }
        true
    }

    fn open_buffer(&mut self) -> Result<(), ClientError> {
        let enabled = match self.buffering.take() {
            None | Some(Buffering::Disabled) => false,
            Some(Buffering::Enabled) => true,
            Some(Buffering::Sink(sink)) => {
                self.sink = Some(sink);
                return Ok(());
            }
            Some(Buffering::When(predicate)) => predicate(self.current.headers())?,
        };

        if enabled {
            self.sink = Some(Box::new(Cursor::new(Vec::new())));
        }
        Ok(())
    }

    /// Stop the response for good and surface `err` as its terminal chunk
    fn abort(&mut self, err: ClientError) {
        warn!(response = %self.id, url = %self.url(), error = %err, "response aborted");

        self.error = Some(err.clone());
        self.pause = None;
        self.current.cancel();
        self.terminal = Some(Chunk::Error(err.clone()));
        self.queue.push_back(Chunk::Error(err).into());
        self.finished = true;
    }

    /// A terminal chunk went out: nothing more is pulled from this response
    fn close(&mut self) {
        self.pause = None;
        if !self.current.is_finished() {
            self.current.cancel();
        }
        self.finished = true;
        debug!(response = %self.id, offset = self.offset, "response finished");
    }
}
