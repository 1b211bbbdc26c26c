use futures::future::poll_fn;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tracing::debug;

use super::{DecoratedResponse, ResponseId};
use crate::transport::Transport;
use crate::{Chunk, ClientError, StreamEvent};

/// Drive `responses` concurrently, yielding what their interceptors publish
///
/// Events of one response keep their order; events of different responses
/// interleave as data arrives. When `timeout` elapses without any chunk, every
/// active response that is not paused receives a [`Chunk::Timeout`].
/// Responses that already finished only replay their terminal chunk, without
/// running their interceptor again.
///
/// Fails with a usage error when the responses belong to different transports.
pub fn stream<'a>(
    responses: &'a mut [DecoratedResponse],
    timeout: Option<Duration>,
) -> Result<BoxStream<'a, (ResponseId, StreamEvent)>, ClientError> {
    if let Some((first, rest)) = responses.split_first() {
        if rest
            .iter()
            .any(|response| !same_transport(first.transport(), response.transport()))
        {
            return Err(ClientError::usage(
                "Cannot stream decorated responses that belong to different transports.",
            ));
        }
    }

    let replay = responses
        .iter()
        .filter(|response| response.is_finished() && !response.has_queued())
        .filter_map(|response| {
            response
                .terminal()
                .map(|chunk| (response.id(), StreamEvent::from(chunk)))
        })
        .collect();

    let driver = Driver {
        responses,
        timeout,
        replay,
        cursor: 0,
    };

    Ok(stream::unfold(driver, |mut driver| async move {
        let item = driver.next_event().await?;
        Some((item, driver))
    })
    .boxed())
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct Driver<'a> {
    responses: &'a mut [DecoratedResponse],
    timeout: Option<Duration>,
    replay: VecDeque<(ResponseId, StreamEvent)>,
    cursor: usize,
}

impl<'a> Driver<'a> {
    async fn next_event(&mut self) -> Option<(ResponseId, StreamEvent)> {
        if let Some(item) = self.replay.pop_front() {
            return Some(item);
        }

        loop {
            if let Some(item) = self.pop_queued() {
                return Some(item);
            }
            if !self.responses.iter().any(DecoratedResponse::is_active) {
                return None;
            }

            let awake = self
                .responses
                .iter()
                .any(|response| response.is_active() && !response.is_paused());
            let pulled = match self.timeout {
                Some(timeout) if awake => tokio::time::timeout(timeout, self.pull()).await.ok(),
                _ => Some(self.pull().await),
            };

            match pulled {
                Some((index, Some(chunk))) => self.responses[index].dispatch(chunk),
                Some((index, None)) => self.responses[index].on_exhausted(),
                None => {
                    for response in self
                        .responses
                        .iter_mut()
                        .filter(|response| response.is_active() && !response.is_paused())
                    {
                        debug!(response = %response.id(), "idle timeout reached");
                        response.dispatch(Chunk::Timeout);
                    }
                }
            }
        }
    }

    fn pop_queued(&mut self) -> Option<(ResponseId, StreamEvent)> {
        self.responses.iter_mut().find_map(|response| {
            let event = response.pop_event()?;
            Some((response.id(), event))
        })
    }

    /// Wait for the next chunk of any active response, round-robin
    fn pull(&mut self) -> impl Future<Output = (usize, Option<Chunk>)> + '_ {
        let start = self.cursor;
        let responses = &mut *self.responses;
        let cursor = &mut self.cursor;

        poll_fn(move |cx| {
            let count = responses.len();
            for step in 0..count {
                let index = (start + step) % count;
                let response = &mut responses[index];
                if !response.is_active() {
                    continue;
                }
                if let Poll::Ready(chunk) = response.poll_pull(cx) {
                    *cursor = index + 1;
                    return Poll::Ready((index, chunk));
                }
            }
            Poll::Pending
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::{intercept_fn, Buffering, InterceptorContext};
    use crate::transport::{MockResponse, MockTransport, Request};
    use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect_chunks(events: Vec<(ResponseId, StreamEvent)>) -> Vec<Chunk> {
        events
            .into_iter()
            .filter_map(|(_, event)| event.chunk().cloned())
            .collect()
    }

    fn raw(transport: &Arc<MockTransport>, url: &str) -> DecoratedResponse {
        DecoratedResponse::builder(transport.clone(), Request::get(url))
            .passthrough()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_forwards_chunks_in_order() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("ab").body("cd")]));
        let mut responses = [raw(&transport, "http://localhost/")];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        let chunks = collect_chunks(events);

        assert_eq!(chunks.len(), 4);
        assert!(chunks[0].is_first());
        assert_eq!(chunks[1].content(), b"ab");
        assert_eq!(chunks[2].content(), b"cd");
        assert!(chunks[3].is_last());
        assert_eq!(responses[0].offset(), 4);
        assert!(responses[0].is_finished());
    }

    #[tokio::test]
    async fn test_build_requires_an_interceptor() {
        let transport = Arc::new(MockTransport::default());
        let err = DecoratedResponse::builder(transport, Request::get("http://localhost/"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Usage(_)));
    }

    #[tokio::test]
    async fn test_mixed_transports_are_rejected() {
        let a = Arc::new(MockTransport::new([MockResponse::new()]));
        let b = Arc::new(MockTransport::new([MockResponse::new()]));
        let mut responses = [raw(&a, "http://a/"), raw(&b, "http://b/")];

        assert!(matches!(
            stream(&mut responses, None).err(),
            Some(ClientError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_per_response_order_when_interleaved() {
        let transport = Arc::new(
            MockTransport::default()
                .route("http://a/", MockResponse::new().body("a1").body("a2").body("a3"))
                .route("http://b/", MockResponse::new().body("b1").body("b2")),
        );
        let mut responses = [raw(&transport, "http://a/"), raw(&transport, "http://b/")];
        let (a, b) = (responses[0].id(), responses[1].id());

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        let body = |id: ResponseId| -> Vec<u8> {
            events
                .iter()
                .filter(|(owner, _)| *owner == id)
                .filter_map(|(_, event)| event.chunk())
                .flat_map(|chunk| chunk.content().to_vec())
                .collect()
        };

        assert_eq!(body(a), b"a1a2a3");
        assert_eq!(body(b), b"b1b2");
        assert_eq!(events.iter().filter(|(_, e)| e.is_last()).count(), 2);
    }

    #[tokio::test]
    async fn test_retry_on_404_is_invisible_to_the_caller() {
        let transport = Arc::new(MockTransport::new([
            MockResponse::new().status(404).body("missing"),
            MockResponse::new().body("found"),
        ]));
        let mut responses = [DecoratedResponse::with_fn(
            transport.clone(),
            Request::get("http://localhost/"),
            |chunk, ctx: &mut InterceptorContext<'_>| {
                if chunk.is_first() && ctx.status() == Some(reqwest::StatusCode::NOT_FOUND) {
                    let request = Request::get(ctx.url());
                    ctx.replace_request(&request);
                    return Ok(vec![]);
                }
                ctx.passthrough(None);
                Ok(vec![chunk.into()])
            },
        )];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        let chunks = collect_chunks(events);

        assert!(chunks[0].is_first());
        assert_eq!(chunks[1].content(), b"found");
        assert!(chunks[2].is_last());
        assert_eq!(responses[0].status(), Some(reqwest::StatusCode::OK));
        assert_eq!(responses[0].previous_info().len(), 1);
        assert_eq!(
            responses[0].previous_info()[0].status,
            Some(reqwest::StatusCode::NOT_FOUND)
        );
        assert!(responses[0].previous_info()[0].canceled);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_yielded_last_ends_the_response() {
        let owners = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = owners.clone();
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("head").body("tail")]));
        let mut responses = [DecoratedResponse::with_fn(
            transport,
            Request::get("http://localhost/"),
            move |chunk, ctx: &mut InterceptorContext<'_>| {
                seen.lock().unwrap().push(ctx.response_id());
                if chunk.content() == b"head" {
                    return Ok(vec![
                        ctx.create_chunk("head").into(),
                        Chunk::Last.into(),
                        ctx.create_chunk("dropped").into(),
                    ]);
                }
                Ok(vec![chunk.into()])
            },
        )];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        let chunks = collect_chunks(events);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_first());
        assert_eq!(chunks[1].content(), b"head");
        assert!(chunks[2].is_last());
        assert_eq!(responses[0].offset(), 4);
        assert!(responses[0].is_finished());
        assert!(responses[0].is_canceled());

        // First and the "head" chunk only; "tail" and the cancellation never reach it
        let owners = owners.lock().unwrap().clone();
        assert_eq!(owners, vec![responses[0].id(); 2]);

        let again: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(again.len(), 1);
        assert!(again[0].1.is_last());
    }

    #[tokio::test]
    async fn test_yielded_error_ends_the_response() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("a").body("b")]));
        let mut responses = [DecoratedResponse::with_fn(
            transport,
            Request::get("http://localhost/"),
            |chunk, _ctx: &mut InterceptorContext<'_>| {
                if chunk.content() == b"a" {
                    return Ok(vec![Chunk::Error(ClientError::connection_lost("cut")).into()]);
                }
                Ok(vec![chunk.into()])
            },
        )];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;

        assert_eq!(events.len(), 2);
        assert!(events[0].1.is_first());
        assert!(events[1].1.error().is_some());
        assert!(responses[0].error().is_some());
        assert_eq!(responses[0].offset(), 0);
    }

    #[tokio::test]
    async fn test_processing_happens_once() {
        let last_chunks = Arc::new(AtomicUsize::new(0));
        let seen = last_chunks.clone();
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("x")]));
        let mut responses = [DecoratedResponse::with_fn(
            transport,
            Request::get("http://localhost/"),
            move |chunk, _ctx: &mut InterceptorContext<'_>| {
                if chunk.is_last() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(vec![chunk.into()])
            },
        )];

        let first: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert!(first.last().unwrap().1.is_last());
        assert_eq!(last_chunks.load(Ordering::SeqCst), 1);

        let second: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(second.len(), 1);
        assert!(second[0].1.is_last());
        assert_eq!(last_chunks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_yields_timeout_chunk() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("x").stall()]));
        let mut responses = [raw(&transport, "http://localhost/")];

        let mut events = stream(&mut responses, Some(Duration::from_millis(100))).unwrap();
        assert!(events.next().await.unwrap().1.is_first());
        assert_eq!(events.next().await.unwrap().1.chunk().unwrap().content(), b"x");
        assert!(events.next().await.unwrap().1.is_timeout());
        assert!(events.next().await.unwrap().1.is_timeout());
    }

    #[tokio::test]
    async fn test_interceptor_error_ends_the_response() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("x").stall()]));
        let mut responses = [DecoratedResponse::new(
            transport,
            Request::get("http://localhost/"),
            intercept_fn(|chunk, _ctx| {
                if chunk.content() == b"x" {
                    return Err(ClientError::usage("boom"));
                }
                Ok(vec![chunk.into()])
            }),
        )];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].1.is_first());
        assert!(matches!(events[1].1.error(), Some(ClientError::Usage(_))));
        assert!(responses[0].is_finished());
        assert!(responses[0].is_canceled());
        assert!(responses[0].info("error").is_some());
    }

    #[tokio::test]
    async fn test_cancel_delivers_last_to_interceptor() {
        let saw_last = Arc::new(AtomicUsize::new(0));
        let counter = saw_last.clone();
        let transport = Arc::new(MockTransport::new([MockResponse::new().stall()]));
        let mut responses = [DecoratedResponse::with_fn(
            transport,
            Request::get("http://localhost/"),
            move |chunk, _ctx: &mut InterceptorContext<'_>| {
                if chunk.is_last() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(vec![chunk.into()])
            },
        )];

        {
            let mut events = stream(&mut responses, None).unwrap();
            assert!(events.next().await.unwrap().1.is_first());
        }
        responses[0].cancel();

        let rest: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(rest.len(), 1);
        assert!(rest[0].1.is_last());
        assert_eq!(saw_last.load(Ordering::SeqCst), 1);
        assert_eq!(responses[0].info("canceled"), Some(true.into()));
    }

    struct ShortSink(Cursor<Vec<u8>>);

    impl Read for ShortSink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(&buf[..buf.len().saturating_sub(1)])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for ShortSink {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    #[tokio::test]
    async fn test_short_sink_write_aborts() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("abc").body("def")]));
        let mut responses = [DecoratedResponse::builder(transport, Request::get("http://localhost/"))
            .passthrough()
            .buffering(Buffering::sink(ShortSink(Cursor::new(Vec::new()))))
            .build()
            .unwrap()];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(events.len(), 2);
        match events[1].1.error() {
            Some(ClientError::Transport(err)) => {
                assert_eq!(err.error_type, crate::TransportErrorType::BufferWrite)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(responses[0].offset(), 0);
    }

    #[tokio::test]
    async fn test_buffer_predicate_error_aborts_after_first() {
        let transport = Arc::new(MockTransport::new([MockResponse::new().body("abc")]));
        let mut responses = [DecoratedResponse::builder(transport, Request::get("http://localhost/"))
            .passthrough()
            .buffering(Buffering::when(|_headers| Err(ClientError::usage("no buffering"))))
            .build()
            .unwrap()];

        let events: Vec<_> = stream(&mut responses, None).unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].1.is_first());
        assert!(events[1].1.error().is_some());
    }
}
