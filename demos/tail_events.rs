//! Print every message of an event stream until it ends
//!
//! ```text
//! cargo run --example tail_events -- https://example.com/events
//! ```

use eventdelta::{EventSourceClient, EventSourceConfig, HttpConfig, HttpTransport, Request};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    eventdelta::init_tracing();

    let url = std::env::args()
        .nth(1)
        .ok_or("usage: tail_events <url>")?;

    let transport = HttpTransport::from_config(&HttpConfig::for_event_stream())?;
    let config = EventSourceConfig::builder()
        .reconnection_time(Duration::from_secs(3))
        .max_reconnect_attempts(10)
        .build();
    let client = EventSourceClient::with_config(Arc::new(transport), config);

    let mut response = client.connect(Request::get(url));
    let mut messages = client.messages(&mut response);

    while let Some(message) = messages.next().await {
        match message {
            Ok(message) => println!("[{}] {}", message.event(), message.data()),
            Err(err) => {
                warn!(error = %err, "stream ended with an error");
                break;
            }
        }
    }
    drop(messages);

    info!(
        last_event_id = ?response.info("last_event_id"),
        stats = %client.metrics().get_stats().summary(),
        "stream closed"
    );
    Ok(())
}
