//! Chunk stream adapters
//!
//! Streaming RPCs carry a byte stream as a sequence of bounded, discrete
//! messages ("chunks"). These adapters bridge between that representation and
//! the `tokio::io` byte traits:
//!
//! - [`ChunkReader`] pulls chunks from a [`ChunkReceiver`] and exposes them as
//!   an [`AsyncRead`](tokio::io::AsyncRead).
//! - [`ChunkWriter`] turns every write on an [`AsyncWrite`](tokio::io::AsyncWrite)
//!   into exactly one chunk handed to a [`ChunkSender`].
//!
//! Neither side knows about a particular RPC framework. Any
//! `Stream<Item = Result<C, E>>` whose items convert into [`Bytes`] is a
//! receiver, which covers `tonic::Streaming<T>` once `T: Into<Bytes>`.

mod reader;
mod writer;

pub use reader::ChunkReader;
pub use writer::ChunkWriter;

use bytes::Bytes;
use std::error::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::Stream;

/// Boxed error type the adapters accept from chunk sources and sinks.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Source of chunks: "receive the next chunk, or learn that the stream ended".
///
/// `Poll::Ready(None)` is a clean end of stream, `Poll::Ready(Some(Err(_)))` a
/// failed one. Either is terminal.
pub trait ChunkReceiver {
    type Error: Into<BoxError>;

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Self::Error>>>;
}

impl<S, C, E> ChunkReceiver for S
where
    S: Stream<Item = Result<C, E>> + Unpin,
    C: Into<Bytes>,
    E: Into<BoxError>,
{
    type Error = E;

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, E>>> {
        Pin::new(self)
            .poll_next(cx)
            .map(|item| item.map(|res| res.map(Into::into)))
    }
}

/// Sink of chunks: "send this chunk".
///
/// `poll_ready` must return `Ready(Ok(()))` before each call to `send`.
pub trait ChunkSender {
    type Error: Into<BoxError>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    fn send(&mut self, chunk: Bytes) -> Result<(), Self::Error>;
}

/// Surface a source or sink error as an `io::Error`, keeping its kind when
/// it already is one.
pub(crate) fn into_io_error(err: impl Into<BoxError>) -> std::io::Error {
    match err.into().downcast::<std::io::Error>() {
        Ok(err) => *err,
        Err(other) => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}
