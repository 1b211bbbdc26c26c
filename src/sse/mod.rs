//! Server-Sent Events: parsing, reconnection and the client facade

mod client;
mod message;
pub mod parser;
mod reconnect;

pub use client::{EventSourceClient, EventSourceConfig, EventSourceConfigBuilder, Messages};
pub use message::Message;
pub use parser::{parse, strip_bom, BOM};
pub use reconnect::{
    Phase, ReconnectionController, StreamState, EVENT_STREAM, LAST_EVENT_ID,
};
