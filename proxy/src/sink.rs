//! Writers that move capture bytes into an HTTP response body

use bytes::{Bytes, BytesMut};
use hyper::Body;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

/// Item type of the response body channel.
pub type BodyChunk = Result<Bytes, io::Error>;

/// Bytes a [`BodyWriter`] holds before shipping without being flushed.
pub const HIGH_WATER_MARK: usize = 32 * 1024;

/// Flushes the wrapped writer after every write.
///
/// A write is reported complete once the bytes are accepted; the flush is
/// finished before the next write is taken, so each write reaches the reader
/// on the other side before the following one starts.
#[derive(Debug)]
pub struct FlushingSink<W> {
    inner: W,
    flush_pending: bool,
}

impl<W> FlushingSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            flush_pending: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FlushingSink<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.flush_pending {
            ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
            this.flush_pending = false;
        }

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => result?,
            Poll::Pending => this.flush_pending = true,
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        this.flush_pending = false;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// `AsyncWrite` end of a streaming response body.
///
/// Writes are buffered. Buffered bytes are handed to the body as one chunk on
/// flush, on shutdown, or before a write once [`HIGH_WATER_MARK`] is reached.
/// Once the body is gone (the client disconnected) writes fail with
/// `BrokenPipe`.
#[derive(Debug)]
pub struct BodyWriter {
    tx: PollSender<BodyChunk>,
    buf: BytesMut,
    shipped: u64,
}

impl BodyWriter {
    pub fn new(tx: mpsc::Sender<BodyChunk>) -> Self {
        Self {
            tx: PollSender::new(tx),
            buf: BytesMut::new(),
            shipped: 0,
        }
    }

    /// A writer and the response body it feeds.
    pub fn channel(depth: usize) -> (Self, Body) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(tx), Body::wrap_stream(ReceiverStream::new(rx)))
    }

    /// Bytes handed to the body so far.
    pub fn shipped(&self) -> u64 {
        self.shipped
    }

    fn poll_ship(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| body_closed())?;
        let chunk = self.buf.split().freeze();
        let len = chunk.len() as u64;
        self.tx.send_item(Ok(chunk)).map_err(|_| body_closed())?;
        self.shipped += len;
        Poll::Ready(Ok(()))
    }
}

fn body_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body closed")
}

impl AsyncWrite for BodyWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.tx.get_ref().map_or(true, |tx| tx.is_closed()) {
            return Poll::Ready(Err(body_closed()));
        }
        if this.buf.len() >= HIGH_WATER_MARK {
            ready!(this.poll_ship(cx))?;
        }
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_ship(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_ship(cx))?;
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::HttpBody;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_body_writer_holds_until_flush() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = BodyWriter::new(tx);

        writer.write_all(b"abc").await.unwrap();
        writer.write_all(b"def").await.unwrap();
        assert!(rx.try_recv().is_err());

        writer.flush().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(writer.shipped(), 6);
    }

    #[tokio::test]
    async fn test_body_writer_ships_past_high_water_mark() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = BodyWriter::new(tx);

        writer.write_all(&vec![1u8; HIGH_WATER_MARK]).await.unwrap();
        writer.write_all(b"x").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().len(), HIGH_WATER_MARK);

        writer.shutdown().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"x"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_body_writer_reports_closed_body() {
        let (mut writer, body) = BodyWriter::channel(4);
        drop(body);
        let err = writer.write_all(b"lost").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_flushing_sink_delivers_each_write() {
        let (writer, mut body) = BodyWriter::channel(4);
        let mut sink = FlushingSink::new(writer);

        sink.write_all(b"first").await.unwrap();
        assert_eq!(body.data().await.unwrap().unwrap(), Bytes::from_static(b"first"));

        sink.write_all(b"second").await.unwrap();
        assert_eq!(body.data().await.unwrap().unwrap(), Bytes::from_static(b"second"));

        sink.shutdown().await.unwrap();
        assert!(body.data().await.is_none());
        assert_eq!(sink.get_ref().shipped(), 11);
    }
}
