//! Push-based byte writer over a chunk sink

use super::{into_io_error, ChunkSender};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;

/// Sends every write as exactly one chunk.
///
/// There is no batching and no splitting: a write of `n` bytes produces one
/// chunk of `n` bytes (including `n == 0`). Callers writing in small
/// increments get many small messages; wrap the writer in a
/// [`tokio::io::BufWriter`] to get larger frames. A failed send reports the
/// error and no bytes written.
#[derive(Debug)]
pub struct ChunkWriter<S> {
    sender: S,
}

impl<S> ChunkWriter<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    pub fn get_ref(&self) -> &S {
        &self.sender
    }

    pub fn into_inner(self) -> S {
        self.sender
    }
}

impl<S: ChunkSender + Unpin> AsyncWrite for ChunkWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.sender.poll_ready(cx)).map_err(into_io_error)?;
        this.sender
            .send(Bytes::copy_from_slice(buf))
            .map_err(into_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Nothing is held back between writes.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
