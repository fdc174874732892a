//! Activity-monitored connection: a sliding inactivity window plus LRU
//! promotion on I/O.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use super::lru::LruConnEntry;

/// Activity observations for one connection, shared with telemetry so it
/// can be read while the connection is in use.
pub struct ActivityMonitor {
    start: Instant,
    last_activity_nanos: AtomicU64,
}

impl ActivityMonitor {
    fn new() -> Self {
        ActivityMonitor {
            start: Instant::now(),
            last_activity_nanos: AtomicU64::new(0),
        }
    }

    fn mark_active(&self) {
        let nanos = self.start.elapsed().as_nanos() as u64;
        self.last_activity_nanos.store(nanos, Ordering::Relaxed);
    }

    /// When the connection was wrapped.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Elapsed time between construction and the most recent qualifying
    /// read or write.
    pub fn active_duration(&self) -> Duration {
        Duration::from_nanos(self.last_activity_nanos.load(Ordering::Relaxed))
    }
}

/// Connection wrapper enforcing an inactivity window.
///
/// With a timeout, a read parked past the window fails with `TimedOut`;
/// every qualifying read slides the window forward. Writes qualify only
/// when `active_on_write` is set (for server-side tunnels, client-initiated
/// traffic is the liveness signal). The LRU entry, when present, is touched
/// on successful I/O in either direction.
pub struct ActivityMonitoredConn<T> {
    inner: T,
    monitor: Arc<ActivityMonitor>,
    inactivity_timeout: Option<Duration>,
    active_on_write: bool,
    lru_entry: Option<LruConnEntry>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> ActivityMonitoredConn<T> {
    pub fn new(
        inner: T,
        inactivity_timeout: Option<Duration>,
        active_on_write: bool,
        lru_entry: Option<LruConnEntry>,
    ) -> Self {
        let deadline = inactivity_timeout.map(|timeout| Box::pin(tokio::time::sleep(timeout)));
        ActivityMonitoredConn {
            inner,
            monitor: Arc::new(ActivityMonitor::new()),
            inactivity_timeout,
            active_on_write,
            lru_entry,
            deadline,
        }
    }

    pub fn monitor(&self) -> Arc<ActivityMonitor> {
        self.monitor.clone()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    // Qualifying I/O: record the activity and slide the window. The
    // deadline is never advanced on error.
    fn note_activity(&mut self) {
        self.monitor.mark_active();
        if let (Some(timeout), Some(deadline)) = (self.inactivity_timeout, self.deadline.as_mut())
        {
            deadline.as_mut().reset(Instant::now() + timeout);
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ActivityMonitoredConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.note_activity();
                    if let Some(entry) = &this.lru_entry {
                        entry.touch();
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "inactivity timeout",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ActivityMonitoredConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    if this.active_on_write {
                        this.note_activity();
                    }
                    if let Some(entry) = &this.lru_entry {
                        entry.touch();
                    }
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
