//! Pull-based byte reader over a chunk stream

use super::{into_io_error, ChunkReceiver};
use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Reassembles a chunk stream into a continuous byte stream.
///
/// A read is satisfied from the internal buffer when it already holds enough
/// bytes. Otherwise chunks are pulled and appended until either the read can
/// be filled, the stream ends, or the source has nothing ready (then the
/// bytes gathered so far are returned). Bytes buffered before the end of stream are
/// always handed out before the end itself is reported: a clean end becomes
/// EOF, a failed stream becomes an error that is repeated on every later read.
#[derive(Debug)]
pub struct ChunkReader<R> {
    receiver: R,
    buf: BytesMut,
    end: Option<StreamEnd>,
}

#[derive(Debug)]
enum StreamEnd {
    Finished,
    Failed {
        kind: io::ErrorKind,
        message: String,
        /// The original error, surfaced on the first failed read.
        first: Option<io::Error>,
    },
}

impl StreamEnd {
    fn failed(err: io::Error) -> Self {
        StreamEnd::Failed {
            kind: err.kind(),
            message: err.to_string(),
            first: Some(err),
        }
    }
}

impl<R> ChunkReader<R> {
    pub fn new(receiver: R) -> Self {
        Self {
            receiver,
            buf: BytesMut::new(),
            end: None,
        }
    }

    /// Bytes received but not yet read.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the underlying stream has reported its terminal signal.
    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    pub fn into_inner(self) -> R {
        self.receiver
    }
}

impl<R: ChunkReceiver + Unpin> AsyncRead for ChunkReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let wanted = out.remaining();
        if wanted == 0 {
            return Poll::Ready(Ok(()));
        }

        while this.buf.len() < wanted && this.end.is_none() {
            let next = match this.receiver.poll_recv(cx) {
                Poll::Ready(next) => next,
                Poll::Pending if this.buf.is_empty() => return Poll::Pending,
                // A live stream with nothing more yet: hand out what arrived
                // instead of holding it back until the read can be filled.
                Poll::Pending => break,
            };
            match next {
                Some(Ok(chunk)) => this.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    let err = into_io_error(err);
                    tracing::debug!(error = %err, buffered = this.buf.len(), "chunk stream failed");
                    this.end = Some(StreamEnd::failed(err));
                }
                None => this.end = Some(StreamEnd::Finished),
            }
        }

        if !this.buf.is_empty() {
            let n = wanted.min(this.buf.len());
            out.put_slice(&this.buf.split_to(n));
            return Poll::Ready(Ok(()));
        }

        match &mut this.end {
            Some(StreamEnd::Failed {
                kind,
                message,
                first,
            }) => {
                let err = first
                    .take()
                    .unwrap_or_else(|| io::Error::new(*kind, message.clone()));
                Poll::Ready(Err(err))
            }
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::io::AsyncReadExt;
    use tokio_stream::Stream;

    /// Chunk source that records how many times it was pulled.
    struct CountingStream {
        items: VecDeque<Result<Bytes, io::Error>>,
        pulls: usize,
    }

    impl CountingStream {
        fn new(chunks: &[&'static str]) -> Self {
            Self {
                items: chunks
                    .iter()
                    .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                    .collect(),
                pulls: 0,
            }
        }

        fn fail_with(mut self, msg: &str) -> Self {
            self.items
                .push_back(Err(io::Error::new(io::ErrorKind::ConnectionReset, msg.to_string())));
            self
        }
    }

    impl Stream for CountingStream {
        type Item = Result<Bytes, io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.pulls += 1;
            Poll::Ready(self.items.pop_front())
        }
    }

    async fn read_all_with(reader: &mut ChunkReader<CountingStream>, size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; size];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_small_buffer_over_repeated_chunks() {
        let data: &'static [u8] = b"this is a test";
        let stream = tokio_stream::iter((0..5).map(|_| Ok::<_, io::Error>(Bytes::from_static(data))));
        let mut reader = ChunkReader::new(stream);
        let expected = data.repeat(5);

        let mut total = 0;
        let mut last = 0;
        let mut buf = [0u8; 8];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(&buf[..n], &expected[total..total + n]);
            total += n;
            last = n;
        }

        assert_eq!(total, 70);
        // 70 = 8 * 8 + 6
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn test_byte_fidelity_across_buffer_sizes() {
        let chunks = &["abc", "", "defghij", "k", "", "lmnopqrstuvwxyz0123456789"];
        let expected = chunks.concat().into_bytes();

        for size in [1, 2, 3, 7, 14, 36, 64] {
            let mut reader = ChunkReader::new(CountingStream::new(chunks));
            let got = read_all_with(&mut reader, size).await;
            assert_eq!(got, expected, "buffer size {}", size);
        }
    }

    #[tokio::test]
    async fn test_partial_read_keeps_remainder_without_pulling() {
        let mut reader = ChunkReader::new(CountingStream::new(&["this is a test"]));
        let mut buf = [0u8; 4];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"this");
        assert_eq!(reader.receiver.pulls, 1);
        assert_eq!(reader.buffered(), 10);

        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b" is ");
        assert_eq!(reader.receiver.pulls, 1);
    }

    #[tokio::test]
    async fn test_large_read_spans_chunks() {
        let mut reader = ChunkReader::new(CountingStream::new(&["ab", "cd", "ef", "gh"]));
        let mut buf = [0u8; 6];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
        assert_eq!(reader.receiver.pulls, 3);
    }

    #[tokio::test]
    async fn test_empty_chunks_are_not_termination() {
        let mut reader = ChunkReader::new(CountingStream::new(&["", "", "x", "", "yz"]));
        let got = read_all_with(&mut reader, 16).await;
        assert_eq!(got, b"xyz");
        assert!(reader.is_terminated());
    }

    #[tokio::test]
    async fn test_error_surfaces_only_after_drain() {
        let stream = CountingStream::new(&["0123456789"]).fail_with("stream reset");
        let mut reader = ChunkReader::new(stream);
        let mut buf = [0u8; 4];

        // Stream is already over after this read, but bytes remain.
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("stream reset"));

        // Sticky.
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("stream reset"));
    }

    #[tokio::test]
    async fn test_clean_end_reads_zero() {
        let mut reader = ChunkReader::new(CountingStream::new(&["abc"]));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_source_keeps_buffered_bytes() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(4);
        let mut reader = ChunkReader::new(tokio_stream::wrappers::ReceiverStream::new(rx));

        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        let producer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        });

        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        producer.await.unwrap();

        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_stream_hands_out_what_arrived() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(4);
        let mut reader = ChunkReader::new(tokio_stream::wrappers::ReceiverStream::new(rx));

        tx.send(Ok(Bytes::from_static(b"first"))).await.unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"first");
        assert_eq!(reader.buffered(), 0);

        drop(tx);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
