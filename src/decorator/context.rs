use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::response::Handler;
use super::{DecoratedResponse, Interceptor, ResponseId};
use crate::transport::{PhysicalResponse, Request};
use crate::Chunk;

/// Handle given to an [`Interceptor`] for the chunk it is processing
///
/// Everything done through the context applies to the decorated response the
/// chunk belongs to. Replacing the request or the response takes effect from
/// the next pull; chunks already yielded are unaffected.
pub struct InterceptorContext<'a> {
    response: &'a mut DecoratedResponse,
}

impl<'a> InterceptorContext<'a> {
    pub(crate) fn new(response: &'a mut DecoratedResponse) -> Self {
        Self { response }
    }

    pub fn response_id(&self) -> ResponseId {
        self.response.id()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.response.current.info().content_type()
    }

    pub fn url(&self) -> &str {
        self.response.url()
    }

    pub fn method(&self) -> &Method {
        self.response.method()
    }

    /// Body bytes published so far
    pub fn offset(&self) -> u64 {
        self.response.offset()
    }

    pub fn info(&self, key: &str) -> Option<Value> {
        self.response.info(key)
    }

    /// Attach a value callers can read back through [`DecoratedResponse::info`]
    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.response.custom_info.insert(key.into(), value.into());
    }

    pub fn is_canceled(&self) -> bool {
        self.response.current.is_canceled()
    }

    /// Cancel the current physical response; a `Last` chunk follows
    pub fn cancel(&mut self) {
        self.response.cancel();
    }

    /// Issue a side request on the same transport without touching this response
    pub fn issue(&self, request: &Request) -> PhysicalResponse {
        PhysicalResponse::issue(self.response.transport().as_ref(), request)
    }

    /// Cancel the current physical response and continue with `request`
    pub fn replace_request(&mut self, request: &Request) {
        let response = &mut *self.response;
        response.current.cancel();

        let next = PhysicalResponse::issue(response.transport().as_ref(), request);
        debug!(
            response = %response.id(),
            previous = response.current.id(),
            physical = next.id(),
            url = %request.url,
            "request replaced"
        );

        let previous = std::mem::replace(&mut response.current, next);
        response.previous_info.push(previous.info().clone());
    }

    /// Continue with chunks from `replacement`, handing back the displaced response
    ///
    /// The displaced response is not canceled; it is up to the interceptor to
    /// drive or drop it.
    pub fn replace_response(&mut self, replacement: PhysicalResponse) -> PhysicalResponse {
        let response = &mut *self.response;
        debug!(
            response = %response.id(),
            previous = response.current.id(),
            physical = replacement.id(),
            "response replaced"
        );

        let previous = std::mem::replace(&mut response.current, replacement);
        response.previous_info.push(previous.info().clone());
        previous
    }

    /// Stop intercepting after this chunk
    ///
    /// With `Some`, later chunks go to `next`; with `None` they are republished
    /// untouched.
    pub fn passthrough(&mut self, next: Option<Box<dyn Interceptor>>) {
        self.response.next_handler = Some(match next {
            Some(interceptor) => Handler::Intercept(interceptor),
            None => Handler::Raw,
        });
    }

    /// Do not pull from this response before `delay` has elapsed
    ///
    /// The driver's idle timeout does not fire for a paused response.
    pub fn pause(&mut self, delay: Duration) {
        self.response.pause = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// Build a data chunk for splicing into the output
    pub fn create_chunk(&self, data: impl Into<Bytes>) -> Chunk {
        Chunk::Data(data.into())
    }
}
