//! reqwest-backed transport and its client configuration

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use once_cell::sync::OnceCell;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::debug;

use crate::transport::{Frame, FrameStream, Request, Transport};
use crate::ClientError;

static SHARED_CLIENT: OnceCell<Client> = OnceCell::new();

/// The process-wide client built from [`HttpConfig::default`]
///
/// Clones share one connection pool.
pub fn shared_client() -> Result<Client, ClientError> {
    SHARED_CLIENT
        .get_or_try_init(|| HttpConfig::default().build_client())
        .cloned()
        .map_err(ClientError::from)
}

/// Connection settings for the reqwest client behind [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Whole-request deadline; leave unset for long-lived streams
    pub request_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    pub http2_adaptive_window: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
            http2_adaptive_window: true,
        }
    }
}

impl HttpConfig {
    /// Settings for event streams that stay open indefinitely
    pub fn for_event_stream() -> Self {
        Self {
            request_timeout: None,
            tcp_keepalive: Some(Duration::from_secs(30)), // detect dead peers between events
            pool_max_idle_per_host: 4,
            ..Default::default()
        }
    }

    /// Settings for ordinary request/response exchanges
    pub fn for_buffered() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            pool_max_idle_per_host: 20,
            ..Default::default()
        }
    }

    /// Build a client from this configuration
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .http2_adaptive_window(self.http2_adaptive_window)
            .use_rustls_tls()
            .user_agent(format!("eventdelta/{}", env!("CARGO_PKG_VERSION")));

        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder.build()
    }
}

/// A [`Transport`] that puts requests on the wire with reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

enum Progress {
    Pending(RequestBuilder),
    Body(BoxStream<'static, reqwest::Result<Bytes>>),
    Done,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self, ClientError> {
        Ok(Self::new(config.build_client()?))
    }

    /// Transport over [`shared_client`]
    pub fn shared() -> Result<Self, ClientError> {
        Ok(Self::new(shared_client()?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn prepare(&self, request: &Request) -> RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn issue(&self, request: &Request) -> FrameStream {
        let builder = self.prepare(request);

        stream::unfold(Progress::Pending(builder), |progress| async move {
            match progress {
                Progress::Pending(builder) => match builder.send().await {
                    Ok(response) => {
                        debug!(url = %response.url(), status = %response.status(), "response head received");
                        let head = Frame::Head {
                            status: response.status(),
                            headers: response.headers().clone(),
                        };
                        Some((head, Progress::Body(response.bytes_stream().boxed())))
                    }
                    Err(err) => Some((Frame::Failed(err.into()), Progress::Done)),
                },
                Progress::Body(mut body) => match body.next().await {
                    Some(Ok(bytes)) => Some((Frame::Body(bytes), Progress::Body(body))),
                    Some(Err(err)) => Some((Frame::Failed(err.into()), Progress::Done)),
                    None => Some((Frame::End, Progress::Done)),
                },
                Progress::Done => None,
            }
        })
        .boxed()
    }
}
