//! Interruptible connection wrapper.
//!
//! Every accepted or dialed connection is wrapped in an
//! [`InterruptibleConn`], whose cloneable [`CloseHandle`] lets any task
//! close the connection out from under blocked I/O. The registry and the
//! LRU list store these handles.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Closes its connection from any task.
///
/// `close` is non-blocking and idempotent. Once closed, pending reads and
/// writes on the wrapped connection wake and fail with `ConnectionAborted`.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    id: u64,
    token: CancellationToken,
}

impl CloseHandle {
    pub fn new() -> Self {
        CloseHandle {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    /// Process-unique id, stable across clones of the same handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the handle is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    fn watch(&self) -> Pin<Box<WaitForCancellationFutureOwned>> {
        Box::pin(self.token.clone().cancelled_owned())
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte stream that fails all I/O once its [`CloseHandle`] is closed.
pub struct InterruptibleConn<T> {
    inner: T,
    handle: CloseHandle,
    // One watcher per direction: the split read and write halves park in
    // separate contexts and each needs its own waker slot.
    read_closed: Pin<Box<WaitForCancellationFutureOwned>>,
    write_closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> std::fmt::Debug for InterruptibleConn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptibleConn")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<T> InterruptibleConn<T> {
    pub fn new(inner: T) -> Self {
        Self::with_handle(inner, CloseHandle::new())
    }

    /// Wrap `inner` under a pre-created handle, used when the handle must
    /// be registered before the connection exists (pending dials).
    pub fn with_handle(inner: T, handle: CloseHandle) -> Self {
        InterruptibleConn {
            read_closed: handle.watch(),
            write_closed: handle.watch(),
            inner,
            handle,
        }
    }

    pub fn handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

impl<T: AsyncRead + Unpin> AsyncRead for InterruptibleConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => {
                if this.read_closed.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(closed_error()));
                }
                Poll::Pending
            }
            ready => ready,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for InterruptibleConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Pending => {
                if this.write_closed.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(closed_error()));
                }
                Poll::Pending
            }
            ready => ready,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Pending => {
                if this.write_closed.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(closed_error()));
                }
                Poll::Pending
            }
            ready => ready,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.handle.is_closed() {
            // The socket is going away regardless; report success.
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = async { listener.accept().await.unwrap().0 };
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn test_passthrough() {
        let (client, mut server) = tcp_pair().await;
        let mut conn = InterruptibleConn::new(client);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (client, _server) = tcp_pair().await;
        let mut conn = InterruptibleConn::new(client);
        let handle = conn.handle();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_closed());
        handle.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader did not unblock")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_io_fails_after_close() {
        let (client, _server) = tcp_pair().await;
        let mut conn = InterruptibleConn::new(client);

        conn.handle().close();

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        let err = conn.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = tcp_pair().await;
        let conn = InterruptibleConn::new(client);
        let handle = conn.handle();
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }
}
