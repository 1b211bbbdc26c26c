//! Scripted in-memory transport for tests and demos

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{Frame, FrameStream, Request, Transport};
use crate::ClientError;

#[derive(Debug, Clone)]
enum MockPart {
    Body(Bytes),
    Delay(Duration),
    Stall,
    Fail(ClientError),
}

/// A canned response: a head followed by body parts, delays and failures
#[derive(Debug, Clone)]
pub struct MockResponse {
    head: Option<(StatusCode, HeaderMap)>,
    parts: Vec<MockPart>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResponse {
    /// A `200 OK` response with an empty body
    pub fn new() -> Self {
        Self {
            head: Some((StatusCode::OK, HeaderMap::new())),
            parts: Vec::new(),
        }
    }

    /// A `200 OK` response announcing `text/event-stream`
    pub fn event_stream() -> Self {
        Self::new().content_type("text/event-stream")
    }

    /// A response that fails before any header arrives
    pub fn unreachable(err: ClientError) -> Self {
        Self {
            head: None,
            parts: vec![MockPart::Fail(err)],
        }
    }

    pub fn status(mut self, code: u16) -> Self {
        if let (Some((status, _)), Ok(code)) = (self.head.as_mut(), StatusCode::from_u16(code)) {
            *status = code;
        }
        self
    }

    /// Add a response header; invalid names or values are skipped
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Some((_, headers)), Ok(name), Ok(value)) = (
            self.head.as_mut(),
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
        self
    }

    pub fn content_type(mut self, value: &str) -> Self {
        if let (Some((_, headers)), Ok(value)) = (self.head.as_mut(), HeaderValue::from_str(value)) {
            headers.insert(CONTENT_TYPE, value);
        }
        self
    }

    /// Append a body chunk
    pub fn body(mut self, chunk: impl Into<Bytes>) -> Self {
        self.parts.push(MockPart::Body(chunk.into()));
        self
    }

    /// Wait before producing the next part
    pub fn delay(mut self, delay: Duration) -> Self {
        self.parts.push(MockPart::Delay(delay));
        self
    }

    /// Never produce anything again
    pub fn stall(mut self) -> Self {
        self.parts.push(MockPart::Stall);
        self
    }

    /// Break the connection after the parts so far
    pub fn fail(mut self, err: ClientError) -> Self {
        self.parts.push(MockPart::Fail(err));
        self
    }

    fn into_frames(self) -> FrameStream {
        let head = self
            .head
            .map(|(status, headers)| Frame::Head { status, headers });
        let parts: VecDeque<MockPart> = self.parts.into();

        stream::unfold(
            (head, parts, false),
            |(mut head, mut parts, done)| async move {
                if done {
                    return None;
                }
                if let Some(frame) = head.take() {
                    return Some((frame, (head, parts, false)));
                }

                loop {
                    match parts.pop_front() {
                        Some(MockPart::Body(bytes)) => {
                            return Some((Frame::Body(bytes), (head, parts, false)))
                        }
                        Some(MockPart::Delay(delay)) => tokio::time::sleep(delay).await,
                        Some(MockPart::Stall) => futures::future::pending::<()>().await,
                        Some(MockPart::Fail(err)) => {
                            return Some((Frame::Failed(err), (head, parts, true)))
                        }
                        None => return Some((Frame::End, (head, parts, true))),
                    }
                }
            },
        )
        .boxed()
    }
}

/// Serves [`MockResponse`]s in order, or per URL, and records every request
#[derive(Debug, Default)]
pub struct MockTransport {
    queue: Mutex<VecDeque<MockResponse>>,
    routes: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    /// Serve `responses` in order, whatever the URL
    pub fn new(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Serve `response` for the next request to exactly `url`
    pub fn route(self, url: impl Into<String>, response: MockResponse) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Every request issued so far, oldest first
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, url: &str) -> Option<MockResponse> {
        let routed = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(url)
            .and_then(VecDeque::pop_front);

        routed.or_else(|| {
            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
        })
    }
}

impl Transport for MockTransport {
    fn issue(&self, request: &Request) -> FrameStream {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let response = self.next_response(&request.url).unwrap_or_else(|| {
            MockResponse::unreachable(ClientError::transport(
                format!("No mock response left for \"{}\".", request.url),
                crate::TransportErrorType::ConnectionFailed,
            ))
        });

        response.into_frames()
    }
}
