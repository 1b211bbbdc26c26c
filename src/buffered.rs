//! Whole-response accessors on top of the streaming driver

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::decorator::{self, Buffering, DecoratedResponse};
use crate::transport::{Request, Transport};
use crate::{Chunk, ClientError, DecodeErrorType, StreamEvent, TransportErrorType};

/// A decorated response read as a whole: status, headers, body, JSON
///
/// Every accessor drives the response as far as it needs to. Body bytes are
/// handed out once; with buffering enabled they can be read again.
#[derive(Debug)]
pub struct BufferedResponse {
    inner: DecoratedResponse,
    timeout: Option<Duration>,
    head_seen: bool,
    content_taken: bool,
    json: Option<Value>,
}

impl BufferedResponse {
    pub fn new(inner: DecoratedResponse) -> Self {
        Self {
            inner,
            timeout: None,
            head_seen: false,
            content_taken: false,
            json: None,
        }
    }

    /// Issue `request` without interception
    pub fn request(
        transport: Arc<dyn Transport>,
        request: Request,
        buffering: impl Into<Buffering>,
    ) -> Result<Self, ClientError> {
        let inner = DecoratedResponse::builder(transport, request)
            .passthrough()
            .buffering(buffering)
            .build()?;
        Ok(Self::new(inner))
    }

    /// Fail accessors when nothing arrives for `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &DecoratedResponse {
        &self.inner
    }

    pub fn into_inner(self) -> DecoratedResponse {
        self.inner
    }

    pub fn info(&self, key: &str) -> Option<Value> {
        self.inner.info(key)
    }

    pub fn cancel(&mut self) {
        self.inner.cancel();
    }

    pub async fn status_code(&mut self) -> Result<StatusCode, ClientError> {
        self.wait_for_head().await?;
        self.inner.status().ok_or_else(|| self.missing_head())
    }

    /// Response headers; with `throw`, 3xx/4xx/5xx statuses are errors
    pub async fn headers(&mut self, throw: bool) -> Result<&HeaderMap, ClientError> {
        self.wait_for_head().await?;
        if throw {
            self.check_status()?;
        }
        Ok(self.inner.headers())
    }

    /// The whole body
    ///
    /// Without buffering the body can only be read once: a second call fails
    /// unless the response has no body (HEAD, 204, 304 or empty).
    pub async fn content(&mut self, throw: bool) -> Result<Bytes, ClientError> {
        self.wait_for_head().await?;
        if throw {
            self.check_status()?;
        }

        if self.content_taken && !self.inner.is_buffered() {
            if self.is_bodiless() || self.inner.offset() == 0 {
                return Ok(Bytes::new());
            }
            return Err(ClientError::transport(
                "Cannot get the content of the response twice: buffering is disabled.",
                TransportErrorType::Other,
            ));
        }

        let mut collected = BytesMut::new();
        let timeout = self.timeout;
        {
            let mut events = decorator::stream(std::slice::from_mut(&mut self.inner), timeout)?;
            while let Some((_, event)) = events.next().await {
                match event {
                    StreamEvent::Chunk(Chunk::Data(bytes)) => collected.extend_from_slice(&bytes),
                    StreamEvent::Chunk(Chunk::Last) => break,
                    StreamEvent::Chunk(Chunk::Error(err)) => return Err(err),
                    StreamEvent::Chunk(Chunk::Timeout) => return Err(idle_timeout(timeout)),
                    _ => {}
                }
            }
        }
        self.content_taken = true;

        match self.inner.read_buffer()? {
            Some(content) => Ok(content),
            None => Ok(collected.freeze()),
        }
    }

    /// The body as a stream of byte chunks
    ///
    /// With `throw`, 3xx/4xx/5xx statuses fail before any byte is read. A body
    /// already read through [`content`](Self::content) is served again from the
    /// buffer; otherwise chunks are yielded as they arrive.
    pub async fn into_stream(
        mut self,
        throw: bool,
    ) -> Result<BoxStream<'static, Result<Bytes, ClientError>>, ClientError> {
        self.wait_for_head().await?;
        if throw {
            self.check_status()?;
        }

        if self.content_taken {
            let content = self.content(false).await?;
            let content = (!content.is_empty()).then_some(Ok(content));
            return Ok(stream::iter(content).boxed());
        }

        Ok(stream::unfold(Some(self), |state| async move {
            let mut response = state?;
            match response.next_body_chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(response))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed())
    }

    /// The body as UTF-8 text
    pub async fn text(&mut self, throw: bool) -> Result<String, ClientError> {
        let content = self.content(throw).await?;
        String::from_utf8(content.to_vec()).map_err(|err| {
            ClientError::decode(
                format!("Response body is not valid UTF-8: {err}"),
                DecodeErrorType::InvalidUtf8,
            )
        })
    }

    /// The body decoded as a JSON object or array
    ///
    /// The content-type must be JSON-compatible (missing means
    /// `application/json`). The decoded value is cached when the body is
    /// buffered.
    pub async fn json(&mut self, throw: bool) -> Result<Value, ClientError> {
        if let Some(json) = &self.json {
            return Ok(json.clone());
        }

        let content = self.content(throw).await?;
        if content.is_empty() {
            return Err(ClientError::transport(
                "Response body is empty.",
                TransportErrorType::Other,
            ));
        }

        let url = self.inner.url().to_string();
        let content_type = self
            .inner
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json");
        if !is_json_content_type(content_type) {
            return Err(ClientError::decode(
                format!(
                    "Response content-type is \"{content_type}\" while a JSON-compatible one was expected for \"{url}\"."
                ),
                DecodeErrorType::ContentType,
            ));
        }

        let value: Value = serde_json::from_slice(&content).map_err(|err| {
            ClientError::decode(
                format!("{err} for \"{url}\"."),
                DecodeErrorType::JsonParsing,
            )
        })?;
        if !(value.is_object() || value.is_array()) {
            return Err(ClientError::decode(
                format!(
                    "JSON content was expected to decode to an object or array, \"{}\" returned for \"{url}\".",
                    json_type(&value)
                ),
                DecodeErrorType::NotContainer,
            ));
        }

        if self.inner.is_buffered() {
            self.json = Some(value.clone());
        }
        Ok(value)
    }

    async fn wait_for_head(&mut self) -> Result<(), ClientError> {
        if self.head_seen {
            return Ok(());
        }

        let timeout = self.timeout;
        if !self.inner.is_finished() {
            let mut events = decorator::stream(std::slice::from_mut(&mut self.inner), timeout)?;
            while let Some((_, event)) = events.next().await {
                match event {
                    StreamEvent::Chunk(Chunk::First) | StreamEvent::Chunk(Chunk::Last) => break,
                    StreamEvent::Chunk(Chunk::Error(err)) => return Err(err),
                    StreamEvent::Chunk(Chunk::Timeout) => return Err(idle_timeout(timeout)),
                    _ => {}
                }
            }
        }

        if let Some(err) = self.inner.error() {
            return Err(err.clone());
        }
        self.head_seen = true;
        Ok(())
    }

    async fn next_body_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        let timeout = self.timeout;
        let mut events = decorator::stream(std::slice::from_mut(&mut self.inner), timeout)?;
        while let Some((_, event)) = events.next().await {
            match event {
                StreamEvent::Chunk(Chunk::Data(bytes)) => return Ok(Some(bytes)),
                StreamEvent::Chunk(Chunk::Last) => return Ok(None),
                StreamEvent::Chunk(Chunk::Error(err)) => return Err(err),
                StreamEvent::Chunk(Chunk::Timeout) => return Err(idle_timeout(timeout)),
                _ => {}
            }
        }
        Ok(None)
    }

    fn check_status(&self) -> Result<(), ClientError> {
        match self
            .inner
            .status()
            .and_then(|status| ClientError::status(status.as_u16(), self.inner.url()))
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_bodiless(&self) -> bool {
        self.inner.method() == Method::HEAD
            || matches!(
                self.inner.status(),
                Some(StatusCode::NO_CONTENT) | Some(StatusCode::NOT_MODIFIED)
            )
    }

    fn missing_head(&self) -> ClientError {
        ClientError::connection_lost(format!(
            "Response for \"{}\" ended without headers.",
            self.inner.url()
        ))
    }
}

fn idle_timeout(timeout: Option<Duration>) -> ClientError {
    ClientError::timeout(format!(
        "Idle timeout of {:?} reached.",
        timeout.unwrap_or_default()
    ))
}

/// Whether `content_type` names a JSON media type, e.g. `application/ld+json`
fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token.eq_ignore_ascii_case("json"))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
