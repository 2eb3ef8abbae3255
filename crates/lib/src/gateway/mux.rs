//! Listener multiplexer: one bound TCP socket, two request-serving branches.
//!
//! Each accepted connection is buffered up to the end of its HTTP header block
//! and classified by the presence of an `Upgrade: websocket` header. The
//! buffered bytes are replayed to whichever branch claims the connection.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on bytes buffered while looking for the end of the header block.
pub const MAX_PEEK: usize = 16 * 1024;
pub const PEEK_TIMEOUT: Duration = Duration::from_secs(10);

const BRANCH_BACKLOG: usize = 64;

/// Which branch owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    WebSocket,
    Http,
}

/// True if the request head carries `Upgrade: websocket` (names and values case-insensitive).
pub fn is_websocket_upgrade(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head);
    head.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
}

/// Offset just past the blank line ending the header block. Lines may end in
/// CRLF or a bare LF.
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            Some(i + 2)
        } else if rest.starts_with(b"\r\n") {
            Some(i + 3)
        } else {
            None
        }
    })
}

/// A stream that yields previously buffered bytes before reading from the socket.
pub struct ReplayStream {
    prefix: Bytes,
    inner: TcpStream,
}

impl ReplayStream {
    pub fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for ReplayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// One branch of the multiplexer, served by its own `axum::serve` loop.
pub struct BranchListener {
    route: Route,
    rx: mpsc::Receiver<(ReplayStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for BranchListener {
    type Io = ReplayStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(conn) => conn,
            None => {
                // Listener closed: stay idle until the server's graceful shutdown fires.
                log::debug!("{:?} branch listener closed", self.route);
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

pub struct Multiplexer {
    listener: TcpListener,
    websocket_tx: mpsc::Sender<(ReplayStream, SocketAddr)>,
    http_tx: mpsc::Sender<(ReplayStream, SocketAddr)>,
}

impl Multiplexer {
    /// Wrap a bound listener; returns the multiplexer and its (WebSocket, HTTP) branches.
    pub fn new(listener: TcpListener) -> Result<(Self, BranchListener, BranchListener)> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::io("reading listener address", e))?;
        let (websocket_tx, websocket_rx) = mpsc::channel(BRANCH_BACKLOG);
        let (http_tx, http_rx) = mpsc::channel(BRANCH_BACKLOG);
        let websocket = BranchListener {
            route: Route::WebSocket,
            rx: websocket_rx,
            local_addr,
        };
        let http = BranchListener {
            route: Route::Http,
            rx: http_rx,
            local_addr,
        };
        Ok((
            Self {
                listener,
                websocket_tx,
                http_tx,
            },
            websocket,
            http,
        ))
    }

    /// Accept until `cancel` fires. Cancellation closes the listener and both
    /// branches; it is the normal way for this loop to end.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("multiplexer listener closed");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    // Per-connection accept failures (e.g. fd exhaustion) are transient.
                    log::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let websocket_tx = self.websocket_tx.clone();
            let http_tx = self.http_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let classified = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = tokio::time::timeout(PEEK_TIMEOUT, classify(stream)) => r,
                };
                let (route, conn) = match classified {
                    Ok(Ok(Some(c))) => c,
                    Ok(Ok(None)) => {
                        log::debug!("{} closed before sending a request", peer);
                        return;
                    }
                    Ok(Err(e)) => {
                        log::debug!("{}: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        log::debug!("{} sent no request within {:?}", peer, PEEK_TIMEOUT);
                        return;
                    }
                };
                log::debug!("routing {} to {:?} branch", peer, route);
                let tx = match route {
                    Route::WebSocket => websocket_tx,
                    Route::Http => http_tx,
                };
                if tx.send((conn, peer)).await.is_err() {
                    log::debug!("{:?} branch closed; dropping {}", route, peer);
                }
            });
        }
    }
}

/// Buffer the request head and decide its route. `None` if the peer closed first.
async fn classify(mut stream: TcpStream) -> io::Result<Option<(Route, ReplayStream)>> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if header_end(&buf).is_some() || buf.len() >= MAX_PEEK {
            break;
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
    }
    let head_len = header_end(&buf).unwrap_or(buf.len());
    let route = if is_websocket_upgrade(&buf[..head_len]) {
        Route::WebSocket
    } else {
        Route::Http
    };
    Ok(Some((route, ReplayStream::new(buf.freeze(), stream))))
}
