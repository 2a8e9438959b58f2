//! Bounded in-memory byte pipe connecting two pipeline stages.
//!
//! The write half is an `AsyncWrite`, the read half an `AsyncRead`, so any
//! stage (frame reader, crypter, backend sink) can sit on either side.
//! A producer reports failure with [`PipeWriter::fail`]; a producer dropped
//! without shutting down surfaces as `BrokenPipe` on the reader, never as a
//! clean end of stream.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Chunks buffered between the two halves.
pub const PIPE_CAPACITY: usize = 16;

/// Largest chunk a single write moves into the pipe.
pub const PIPE_CHUNK_SIZE: usize = 256 * 1024;

type Chunk = io::Result<Bytes>;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let finished = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            tx: PollSender::new(tx),
            finished: Arc::clone(&finished),
        },
        PipeReader {
            rx,
            chunk: Bytes::new(),
            finished,
        },
    )
}

pub struct PipeWriter {
    tx: PollSender<Chunk>,
    finished: Arc<AtomicBool>,
}

impl PipeWriter {
    /// Abort the pipe; the reader's next read returns `err`.
    pub async fn fail(mut self, err: io::Error) {
        if std::future::poll_fn(|cx| self.tx.poll_reserve(cx)).await.is_ok() {
            let _ = self.tx.send_item(Err(err));
        }
        self.tx.close();
    }
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped")
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(reader_gone()));
        }
        let n = buf.len().min(PIPE_CHUNK_SIZE);
        this.tx
            .send_item(Ok(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| reader_gone())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.finished.store(true, Ordering::Release);
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    chunk: Bytes,
    finished: Arc<AtomicBool>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => this.chunk = chunk,
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None if this.finished.load(Ordering::Acquire) => return Poll::Ready(Ok(())),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe writer dropped before completing",
                    )))
                }
            }
        }
    }
}
