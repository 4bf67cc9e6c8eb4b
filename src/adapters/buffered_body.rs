//! Response relay body that coalesces upstream chunks through a pooled buffer.
//!
//! Small upstream chunks are copied into one fixed-capacity buffer borrowed
//! from the [`BufferPool`] and emitted when the buffer fills, when the
//! upstream stalls (subject to the flush policy) or when the stream ends.
//! Chunks at least as large as the buffer pass straight through. The buffer
//! never grows, so it always goes back to the pool on drop.
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::HeaderMap;
use hyper::body::{Body, Frame, SizeHint};
use thiserror::Error;
use tokio::time::{Instant, Sleep, sleep, sleep_until};

use crate::core::buffer_pool::BufferPool;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("deadline exceeded while streaming the response")]
    DeadlineExceeded,

    #[error("upstream body error: {0}")]
    Upstream(#[from] axum::Error),
}

/// When buffered bytes are handed to the caller while the upstream is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// As soon as the upstream has nothing more ready
    Immediate,
    /// After the upstream has been idle for this long
    Interval(Duration),
}

impl FlushPolicy {
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            FlushPolicy::Immediate
        } else {
            FlushPolicy::Interval(interval)
        }
    }
}

pub struct BufferedBody {
    inner: AxumBody,
    pool: BufferPool,
    buf: Option<Vec<u8>>,
    /// Oversized chunk waiting behind buffered bytes
    pending: Option<Bytes>,
    trailers: Option<HeaderMap>,
    policy: FlushPolicy,
    flush_timer: Option<Pin<Box<Sleep>>>,
    deadline: Pin<Box<Sleep>>,
    upstream_done: bool,
    failed: bool,
}

impl BufferedBody {
    pub fn new(inner: AxumBody, pool: BufferPool, policy: FlushPolicy, deadline: Instant) -> Self {
        let buf = pool.acquire();
        Self {
            inner,
            pool,
            buf: Some(buf),
            pending: None,
            trailers: None,
            policy,
            flush_timer: None,
            deadline: Box::pin(sleep_until(deadline)),
            upstream_done: false,
            failed: false,
        }
    }

    fn capacity(&self) -> usize {
        self.pool.buffer_size()
    }

    fn buffered_len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    /// Take the buffered bytes, leaving the buffer empty.
    fn take_buffered(&mut self) -> Option<Bytes> {
        self.flush_timer = None;
        let buf = self.buf.as_mut()?;
        if buf.is_empty() {
            return None;
        }
        let out = Bytes::copy_from_slice(buf);
        buf.clear();
        Some(out)
    }

    /// Accept one data chunk. Returns bytes that must be emitted now.
    fn push_data(&mut self, data: Bytes) -> Option<Bytes> {
        let capacity = self.capacity();
        if self.buffered_len() + data.len() > capacity {
            let flushed = self.take_buffered();
            if data.len() >= capacity {
                return match flushed {
                    Some(out) => {
                        self.pending = Some(data);
                        Some(out)
                    }
                    None => Some(data),
                };
            }
            if let Some(buf) = self.buf.as_mut() {
                buf.extend_from_slice(&data);
            }
            return flushed;
        }

        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(&data);
        }
        if self.buffered_len() == capacity {
            return self.take_buffered();
        }
        None
    }

    /// Decide whether to flush while the upstream has nothing ready.
    fn poll_idle_flush(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if self.buffered_len() == 0 {
            return Poll::Pending;
        }
        match self.policy {
            FlushPolicy::Immediate => Poll::Ready(self.take_buffered()),
            FlushPolicy::Interval(interval) => {
                let timer = self
                    .flush_timer
                    .get_or_insert_with(|| Box::pin(sleep(interval)));
                match timer.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(self.take_buffered()),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl Body for BufferedBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }

        loop {
            if let Some(data) = this.pending.take() {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }

            if this.upstream_done {
                if let Some(out) = this.take_buffered() {
                    return Poll::Ready(Some(Ok(Frame::data(out))));
                }
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            if this.deadline.as_mut().poll(cx).is_ready() {
                this.failed = true;
                return Poll::Ready(Some(Err(RelayError::DeadlineExceeded)));
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        if let Some(out) = this.push_data(data) {
                            return Poll::Ready(Some(Ok(Frame::data(out))));
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers = Some(trailers);
                        }
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(RelayError::Upstream(e))));
                }
                Poll::Ready(None) => this.upstream_done = true,
                Poll::Pending => {
                    return match this.poll_idle_flush(cx) {
                        Poll::Ready(Some(out)) => Poll::Ready(Some(Ok(Frame::data(out)))),
                        _ => Poll::Pending,
                    };
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed
            || (self.upstream_done
                && self.pending.is_none()
                && self.buffered_len() == 0
                && self.trailers.is_none())
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl Drop for BufferedBody {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
