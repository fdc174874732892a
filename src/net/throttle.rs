//! Token-bucket throttled connection with an initial unmetered byte budget
//! per direction.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Per-direction throttling parameters. A rate of 0 leaves that direction
/// unmetered for the life of the connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateLimits {
    pub unmetered_read_bytes: i64,
    pub read_bytes_per_second: u64,
    pub unmetered_write_bytes: i64,
    pub write_bytes_per_second: u64,
}

// Refill-on-demand token bucket holding at most one second of tokens. The
// balance may go negative: `reserve` then reports how long the refill needs
// to cover the deficit. The bucket starts empty; the unmetered budget has
// already granted the connection its burst.
struct TokenBucket {
    rate: f64,
    available: f64,
    updated: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        TokenBucket {
            rate: rate as f64,
            available: 0.0,
            updated: Instant::now(),
        }
    }

    fn reserve(&mut self, bytes: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.available = (self.available + elapsed * self.rate).min(self.rate);
        self.updated = now;
        self.available -= bytes as f64;
        if self.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.available / self.rate)
        }
    }

    fn credit(&mut self, bytes: usize) {
        self.available = (self.available + bytes as f64).min(self.rate);
    }
}

struct Direction {
    unmetered_remaining: i64,
    limiting: bool,
    bucket: Option<TokenBucket>,
    charged: usize,
    waiting: bool,
    delay: Pin<Box<Sleep>>,
}

impl Direction {
    fn new(unmetered_bytes: i64, rate: u64) -> Self {
        Direction {
            unmetered_remaining: unmetered_bytes,
            limiting: false,
            bucket: (rate > 0).then(|| TokenBucket::new(rate)),
            charged: 0,
            waiting: false,
            delay: Box::pin(tokio::time::sleep(Duration::ZERO)),
        }
    }

    // Reserve `want` bytes for the next metered operation, pending while
    // the refill delay runs. A charge left over from an interrupted
    // operation is reused as-is.
    fn poll_reserve(&mut self, want: usize, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.waiting {
                match self.delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.waiting = false,
                }
            }
            if self.charged > 0 {
                return Poll::Ready(());
            }
            let delay = match self.bucket.as_mut() {
                Some(bucket) => bucket.reserve(want),
                None => Duration::ZERO,
            };
            self.charged = want;
            if delay > Duration::ZERO {
                self.delay.as_mut().reset(Instant::now() + delay);
                self.waiting = true;
                continue;
            }
            return Poll::Ready(());
        }
    }

    // The metered operation moved `performed` bytes; return the unused part
    // of the charge to the bucket.
    fn complete(&mut self, performed: usize) {
        let unused = self.charged.saturating_sub(performed);
        if unused > 0 {
            if let Some(bucket) = self.bucket.as_mut() {
                bucket.credit(unused);
            }
        }
        self.charged = 0;
    }
}

/// Connection wrapper rate-limiting each direction with a token bucket
/// after an initial unmetered byte budget is spent.
///
/// The budget is an approximation, not a hard ceiling: the operation that
/// exhausts it is still performed unmetered and may push the counter
/// negative. Once a direction starts limiting it never stops.
pub struct ThrottledConn<T> {
    inner: T,
    read_dir: Direction,
    write_dir: Direction,
}

impl<T> ThrottledConn<T> {
    pub fn new(inner: T, limits: RateLimits) -> Self {
        ThrottledConn {
            inner,
            read_dir: Direction::new(limits.unmetered_read_bytes, limits.read_bytes_per_second),
            write_dir: Direction::new(limits.unmetered_write_bytes, limits.write_bytes_per_second),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ThrottledConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let dir = &mut this.read_dir;

        if dir.bucket.is_none() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if !dir.limiting {
            // Unmetered path. The budget is charged when the read
            // completes so a rescheduled poll is not double-counted; the
            // read that trips the budget still goes through raw.
            let want = buf.remaining();
            let result = Pin::new(&mut this.inner).poll_read(cx, buf);
            if result.is_ready() {
                dir.unmetered_remaining -= want as i64;
                if dir.unmetered_remaining <= 0 {
                    dir.limiting = true;
                }
            }
            return result;
        }

        ready!(dir.poll_reserve(buf.remaining(), cx));
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                dir.complete(buf.filled().len() - before);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                dir.complete(0);
                Poll::Ready(Err(e))
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ThrottledConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let dir = &mut this.write_dir;

        if dir.bucket.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        if !dir.limiting {
            let want = buf.len();
            let result = Pin::new(&mut this.inner).poll_write(cx, buf);
            if result.is_ready() {
                dir.unmetered_remaining -= want as i64;
                if dir.unmetered_remaining <= 0 {
                    dir.limiting = true;
                }
            }
            return result;
        }

        ready!(dir.poll_reserve(buf.len(), cx));
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(n)) => {
                dir.complete(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                dir.complete(0);
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
