//! Rate-limited, progress-reporting writer.
//!
//! No restart semantics: a destination object cannot be resumed mid-stream,
//! so any write error is returned as-is and the enclosing operation decides
//! whether to redo the whole object.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;

use super::limiter::RateGovernor;
use crate::session::Session;

type Permit = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct ProgressWriter<W> {
    inner: W,
    governor: Arc<RateGovernor>,
    session: Option<Arc<Session>>,
    offset: u64,
    /// Budget being waited for, and its size.
    pending: Option<(Permit, usize)>,
    /// Budget granted but not yet spent on a write.
    granted: usize,
}

impl<W: AsyncWrite + Unpin> ProgressWriter<W> {
    pub fn new(inner: W, governor: Arc<RateGovernor>) -> Self {
        Self {
            inner,
            governor,
            session: None,
            offset: 0,
            pending: None,
            granted: 0,
        }
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Bytes accepted by the inner writer so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.governor.is_limited() && this.granted == 0 {
            if this.pending.is_none() {
                let want = this.governor.slice_len(buf.len());
                let governor = Arc::clone(&this.governor);
                let permit: Permit = Box::pin(async move { governor.acquire(want).await });
                this.pending = Some((permit, want));
            }
            if let Some((permit, want)) = this.pending.as_mut() {
                ready!(permit.as_mut().poll(cx));
                this.granted = *want;
            }
            this.pending = None;
        }

        let allowed = if this.governor.is_limited() {
            buf.len().min(this.granted)
        } else {
            buf.len()
        };

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]))?;
        if this.governor.is_limited() {
            this.granted -= n.min(this.granted);
        }
        this.offset += n as u64;
        if let Some(session) = &this.session {
            session.publish_offset(this.offset);
            session.add_bytes(n as u64);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
