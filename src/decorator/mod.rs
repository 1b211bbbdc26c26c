//! Chunk interception: observe, transform, splice or replace a response stream
//!
//! A [`DecoratedResponse`] owns one [`Interceptor`] and a slot holding its
//! current [`PhysicalResponse`](crate::transport::PhysicalResponse). The
//! interceptor sees every chunk of that slot exactly once, through an
//! [`InterceptorContext`] that can swap the slot's content for another
//! request or response without the caller noticing. [`stream`] drives any
//! number of decorated responses that share a transport.

mod context;
mod driver;
mod response;

use reqwest::header::HeaderMap;
use std::fmt;
use std::io::{Read, Seek, Write};

use crate::{Chunk, ClientError, StreamEvent};

pub use context::InterceptorContext;
pub use driver::stream;
pub use response::{DecoratedResponse, DecoratedResponseBuilder, ResponseId};

/// What one interceptor invocation produces
pub type Intercepted = Result<Vec<StreamEvent>, ClientError>;

/// Caller logic applied to every chunk of a decorated response
///
/// Returning an empty vector swallows the chunk. Returning an error cancels
/// the response and surfaces the error as its terminal chunk.
pub trait Interceptor: Send {
    fn intercept(&mut self, chunk: Chunk, ctx: &mut InterceptorContext<'_>) -> Intercepted;
}

impl Interceptor for Box<dyn Interceptor> {
    fn intercept(&mut self, chunk: Chunk, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        (**self).intercept(chunk, ctx)
    }
}

/// An [`Interceptor`] backed by a closure, see [`intercept_fn`]
pub struct InterceptFn<F> {
    f: F,
}

/// Wrap a closure as an [`Interceptor`]
pub fn intercept_fn<F>(f: F) -> InterceptFn<F>
where
    F: FnMut(Chunk, &mut InterceptorContext<'_>) -> Intercepted + Send,
{
    InterceptFn { f }
}

impl<F> Interceptor for InterceptFn<F>
where
    F: FnMut(Chunk, &mut InterceptorContext<'_>) -> Intercepted + Send,
{
    fn intercept(&mut self, chunk: Chunk, ctx: &mut InterceptorContext<'_>) -> Intercepted {
        (self.f)(chunk, ctx)
    }
}

/// Storage a response body can be copied into and read back from
pub trait ContentSink: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ContentSink for T {}

pub(crate) type BufferPredicate = Box<dyn FnOnce(&HeaderMap) -> Result<bool, ClientError> + Send>;

/// Whether and where a decorated response keeps a copy of its body
///
/// The policy is resolved when the first chunk is published, so predicates
/// can look at the response headers.
#[derive(Default)]
pub enum Buffering {
    /// Keep the body in memory
    #[default]
    Enabled,
    /// Hand body chunks out once and forget them
    Disabled,
    /// Decide from the response headers
    When(BufferPredicate),
    /// Copy the body into a caller-provided sink
    Sink(Box<dyn ContentSink>),
}

impl Buffering {
    pub fn when<F>(predicate: F) -> Self
    where
        F: FnOnce(&HeaderMap) -> Result<bool, ClientError> + Send + 'static,
    {
        Buffering::When(Box::new(predicate))
    }

    pub fn sink<S: ContentSink + 'static>(sink: S) -> Self {
        Buffering::Sink(Box::new(sink))
    }
}

impl From<bool> for Buffering {
    fn from(enabled: bool) -> Self {
        if enabled {
            Buffering::Enabled
        } else {
            Buffering::Disabled
        }
    }
}

impl fmt::Debug for Buffering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Buffering::Enabled => f.write_str("Enabled"),
            Buffering::Disabled => f.write_str("Disabled"),
            Buffering::When(_) => f.write_str("When(..)"),
            Buffering::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}
