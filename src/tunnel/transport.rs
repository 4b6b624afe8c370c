//! Tunnel transport — one HTTP/1.1 exchange at a time over the tunnel socket.
//!
//! The wire format is plain HTTP/1.1: the relay writes a complete request
//! message and reads back a complete response message, relying on
//! Content-Length / chunked framing for message boundaries. No envelope, no
//! request ids, no multiplexing.
//!
//! Exchanges are serialized per connection: a caller holds the sender lock
//! until hyper reports the connection idle (the previous response body has
//! been fully read), so concurrent public requests for the same tunnel queue
//! up instead of interleaving bytes on the socket.
//!
//! A response body dropped before its end is drained in the background so the
//! connection stays usable. Only a drain that fails or misses the deadline
//! closes the tunnel.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::error::TunnelError;

/// A live tunnel to one agent.
pub struct TunnelConn {
    sender: Mutex<SendRequest<Body>>,
    /// Drives the hyper connection; owns the socket. Aborting it closes the tunnel.
    driver: JoinHandle<()>,
    closer: Closer,
    timeout: Duration,
    peer: SocketAddr,
    connected_at: Instant,
    served: AtomicU64,
}

/// Shuts a tunnel down from outside the connection (eviction, failed drain).
#[derive(Clone, Debug)]
struct Closer {
    closed: Arc<AtomicBool>,
    driver: AbortHandle,
    peer: SocketAddr,
}

impl Closer {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.driver.abort();
            debug!(peer = %self.peer, "Tunnel closed");
        }
    }
}

impl TunnelConn {
    /// Take ownership of an accepted tunnel socket and start the HTTP/1.1
    /// client connection on it.
    ///
    /// Anything the agent must receive before HTTP traffic (the greeting line)
    /// has to be written before calling this.
    pub async fn open<S>(io: S, peer: SocketAddr, timeout: Duration) -> Result<Self, hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = http1::handshake::<_, Body>(TokioIo::new(io)).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(peer = %peer, "Tunnel connection ended: {e}");
            }
        });
        let closer = Closer {
            closed: Arc::new(AtomicBool::new(false)),
            driver: driver.abort_handle(),
            peer,
        };

        Ok(Self {
            sender: Mutex::new(sender),
            driver,
            closer,
            timeout,
            peer,
            connected_at: Instant::now(),
            served: AtomicU64::new(0),
        })
    }

    /// Forward one request to the agent and wait for its response head.
    ///
    /// Waiting for the previous exchange to finish is not bounded; the
    /// deadline starts once the connection is idle and covers the request
    /// write and the response head. Any error means the tunnel is dead and
    /// should be evicted.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<TunnelBody>, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let mut sender = self.sender.lock().await;
        sender.ready().await?;
        let pending = sender.send_request(req);
        // The next caller's `ready()` blocks until this response body is consumed.
        drop(sender);

        let response = tokio::time::timeout(self.timeout, pending)
            .await
            .map_err(|_| TunnelError::Timeout(self.timeout))??;

        self.served.fetch_add(1, Ordering::Relaxed);
        let closer = self.closer.clone();
        let timeout = self.timeout;
        Ok(response.map(|body| TunnelBody::new(body, closer, timeout)))
    }

    /// Close the tunnel. Idempotent.
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.closed.load(Ordering::Acquire) || self.driver.is_finished()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Number of exchanges that completed successfully.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Response body read from a tunnel.
///
/// Dropping it before the end spawns a drain of the remaining bytes, bounded
/// by the tunnel deadline, so the next exchange can reuse the connection.
#[derive(Debug)]
pub struct TunnelBody {
    inner: Option<Incoming>,
    closer: Closer,
    timeout: Duration,
}

impl TunnelBody {
    fn new(inner: Incoming, closer: Closer, timeout: Duration) -> Self {
        Self {
            inner: Some(inner),
            closer,
            timeout,
        }
    }
}

impl HttpBody for TunnelBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let polled = Pin::new(inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None | Some(Err(_)))) {
            // Finished or broken; nothing left to drain.
            self.inner = None;
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, HttpBody::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), HttpBody::size_hint)
    }
}

impl Drop for TunnelBody {
    fn drop(&mut self) {
        let Some(mut body) = self.inner.take() else {
            return;
        };
        if body.is_end_stream() {
            return;
        }
        let closer = self.closer.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            closer.close();
            return;
        };

        let timeout = self.timeout;
        runtime.spawn(async move {
            let drain = async {
                while let Some(frame) = body.frame().await {
                    frame?;
                }
                Ok::<_, hyper::Error>(())
            };
            match tokio::time::timeout(timeout, drain).await {
                Ok(Ok(())) => debug!(peer = %closer.peer, "Drained abandoned response body"),
                Ok(Err(e)) => {
                    debug!(peer = %closer.peer, "Failed to drain response body: {e}");
                    closer.close();
                }
                Err(_) => {
                    debug!(peer = %closer.peer, "Response body drain timed out");
                    closer.close();
                }
            }
        });
    }
}
