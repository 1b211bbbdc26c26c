//! The transport seam: issue a request, get a cancellable stream of frames
//!
//! Transports only speak [`Frame`]s. [`PhysicalResponse`] turns those frames
//! into [`Chunk`]s, records the response head and enforces the
//! first/data/last ordering every interceptor relies on.

pub mod mock;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;

use crate::{Chunk, ClientError};

pub use mock::{MockResponse, MockTransport};

/// Raw events produced by a transport for one request
#[derive(Debug, Clone)]
pub enum Frame {
    /// Status line and headers
    Head { status: StatusCode, headers: HeaderMap },
    /// A slice of the body
    Body(Bytes),
    /// The body completed normally
    End,
    /// The request failed; no further frames follow
    Failed(ClientError),
}

pub type FrameStream = BoxStream<'static, Frame>;

/// Something that can put requests on the wire
///
/// `issue` must not block: the returned stream does the work when polled, and
/// dropping it cancels the request.
pub trait Transport: Send + Sync {
    fn issue(&self, request: &Request) -> FrameStream;
}

/// A request as handed to a transport
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout, passed through to the transport
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header from strings, rejecting names or values that are not valid HTTP
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::usage(format!("Invalid header name \"{name}\": {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::usage(format!("Invalid value for header \"{name}\": {e}")))?;
        Ok(self.with_header(name, value))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What is known about one physical response so far
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub method: Method,
    pub url: String,
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub canceled: bool,
    pub error: Option<String>,
}

impl ResponseInfo {
    fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            status: None,
            headers: HeaderMap::new(),
            canceled: false,
            error: None,
        }
    }

    /// First `content-type` header value, if readable
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "http_method": self.method.as_str(),
            "url": self.url,
            "http_code": self.status.map(|status| status.as_u16()),
            "canceled": self.canceled,
            "error": self.error,
        })
    }
}

static NEXT_PHYSICAL_ID: AtomicU64 = AtomicU64::new(1);

/// One attempt at a request: the frames of a single underlying response
pub struct PhysicalResponse {
    id: u64,
    info: ResponseInfo,
    frames: Option<FrameStream>,
    head_seen: bool,
    pending_last: bool,
}

impl std::fmt::Debug for PhysicalResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalResponse")
            .field("id", &self.id)
            .field("url", &self.info.url)
            .field("status", &self.info.status)
            .field("canceled", &self.info.canceled)
            .finish()
    }
}

impl PhysicalResponse {
    /// Hand `request` to `transport`
    pub fn issue(transport: &dyn Transport, request: &Request) -> Self {
        let id = NEXT_PHYSICAL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(physical = id, method = %request.method, url = %request.url, "issuing request");

        Self {
            id,
            info: ResponseInfo::for_request(request),
            frames: Some(transport.issue(request)),
            head_seen: false,
            pending_last: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &ResponseInfo {
        &self.info
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.info.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.info.headers
    }

    pub fn is_canceled(&self) -> bool {
        self.info.canceled
    }

    /// Whether every chunk of this response has been handed out
    pub fn is_finished(&self) -> bool {
        self.frames.is_none() && !self.pending_last
    }

    /// Drop the underlying request; a final `Last` chunk reports the cancellation
    pub fn cancel(&mut self) {
        if self.info.canceled {
            return;
        }

        self.info.canceled = true;
        if self.frames.take().is_some() {
            debug!(physical = self.id, url = %self.info.url, "request canceled");
            self.pending_last = true;
        }
    }

    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        if self.pending_last {
            self.pending_last = false;
            return Poll::Ready(Some(Chunk::Last));
        }

        loop {
            let frame = match self.frames.as_mut() {
                None => return Poll::Ready(None),
                Some(frames) => match frames.poll_next_unpin(cx) {
                    Poll::Ready(frame) => frame,
                    Poll::Pending => return Poll::Pending,
                },
            };

            let chunk = match frame {
                Some(Frame::Head { status, headers }) => {
                    if self.head_seen {
                        continue;
                    }
                    self.head_seen = true;
                    self.info.status = Some(status);
                    self.info.headers = headers;
                    Chunk::First
                }
                Some(Frame::Body(_)) | Some(Frame::End) if !self.head_seen => {
                    self.fail(ClientError::connection_lost(format!(
                        "Response body for \"{}\" arrived before its headers.",
                        self.info.url
                    )))
                }
                Some(Frame::Body(bytes)) if bytes.is_empty() => continue,
                Some(Frame::Body(bytes)) => Chunk::Data(bytes),
                Some(Frame::End) => {
                    self.frames = None;
                    Chunk::Last
                }
                Some(Frame::Failed(err)) => self.fail(err),
                None => self.fail(ClientError::connection_lost(format!(
                    "Connection to \"{}\" closed before the response completed.",
                    self.info.url
                ))),
            };

            return Poll::Ready(Some(chunk));
        }
    }

    fn fail(&mut self, err: ClientError) -> Chunk {
        self.info.error = Some(err.to_string());
        self.frames = None;
        Chunk::Error(err)
    }
}

impl Stream for PhysicalResponse {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        self.get_mut().poll_chunk(cx)
    }
}
