//! Tunnel proxy: bridges one WebSocket session to a private UDP socket.
//!
//! Two pumps run concurrently under one cancellation scope per session; the
//! first to stop cancels the other. The UDP socket and the WebSocket are
//! released on every exit path.

use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::net;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Client-local port keepalive; never forwarded to the server.
pub const PORT_KEEPALIVE: &[u8] = b"\xff\xff\xff\xffport";
pub const UDP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_READ_BUFFER: usize = 1024 * 1024;

/// Per-gateway tunnel state: backend address and the gateway's cancellation root.
pub struct TunnelProxy {
    backend: SocketAddr,
    shutdown: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
}

/// Why a pump stopped.
#[derive(Debug)]
enum PumpExit {
    /// The other pump (or the gateway) stopped the session.
    Cancelled,
    /// Peer sent a close frame (or none, when the frame is absent).
    PeerClosed(Option<CloseFrame>),
    /// The WebSocket stream ended without a close frame.
    PeerVanished,
    Failed(Error),
}

impl TunnelProxy {
    pub fn new(
        backend: SocketAddr,
        shutdown: CancellationToken,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            backend,
            shutdown,
            metrics,
        }
    }

    pub fn backend(&self) -> SocketAddr {
        self.backend
    }

    /// Run one session on an upgraded socket until either side closes or errors.
    pub async fn run_session(&self, socket: WebSocket) {
        let id = uuid::Uuid::new_v4();
        let udp = match open_backend_socket(self.backend).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("tunnel {}: {}", id, e);
                return;
            }
        };
        self.metrics.tunnel_opened();
        log::debug!(
            "tunnel {}: bridging to {} via {:?}",
            id,
            self.backend,
            udp.local_addr().ok()
        );

        let scope = self.shutdown.child_token();
        let (mut ws_tx, ws_rx) = socket.split();
        let (inbound, outbound) = tokio::join!(
            inbound_pump(ws_rx, &udp, &scope),
            outbound_pump(&udp, &mut ws_tx, &scope),
        );

        match &inbound {
            // The websocket layer has already answered the peer's close frame.
            PumpExit::PeerClosed(Some(f)) if is_abnormal_close(f) => {
                log::info!("tunnel {}: closed with code {}: {}", id, f.code, f.reason);
            }
            PumpExit::PeerClosed(_) => {}
            PumpExit::PeerVanished => log::info!("tunnel {}: peer went away without closing", id),
            PumpExit::Failed(e) => log::warn!("tunnel {}: {}", id, e),
            PumpExit::Cancelled => {}
        }
        if let PumpExit::Failed(e) = &outbound {
            log::warn!("tunnel {}: {}", id, e);
        }
        let _ = ws_tx.close().await;
        drop(udp);
        self.metrics.tunnel_closed();
        log::debug!("tunnel {}: closed", id);
    }
}

/// Closes other than a normal close or a page navigating away.
fn is_abnormal_close(frame: &CloseFrame) -> bool {
    !matches!(frame.code, close_code::NORMAL | close_code::AWAY)
}

async fn open_backend_socket(backend: SocketAddr) -> Result<UdpSocket> {
    let udp = UdpSocket::bind(net::ephemeral_bind_addr(&backend))
        .await
        .map_err(|e| Error::io("binding tunnel socket", e))?;
    // Connected, so only backend datagrams arrive. While the backend is down
    // (e.g. between a restart's kill and spawn) the kernel reports ICMP port
    // unreachable as ConnectionRefused on recv, which ends the session; the
    // browser client reconnects.
    udp.connect(backend)
        .await
        .map_err(|e| Error::io(format!("associating tunnel socket with {}", backend), e))?;
    Ok(udp)
}

pub fn is_port_keepalive(msg: &[u8]) -> bool {
    msg.starts_with(PORT_KEEPALIVE)
}

/// WebSocket → UDP, one message at a time.
async fn inbound_pump(
    mut ws_rx: SplitStream<WebSocket>,
    udp: &UdpSocket,
    scope: &CancellationToken,
) -> PumpExit {
    let exit = loop {
        let next = tokio::select! {
            _ = scope.cancelled() => break PumpExit::Cancelled,
            next = ws_rx.next() => next,
        };
        let payload: Bytes = match next {
            Some(Ok(Message::Binary(b))) => b,
            Some(Ok(Message::Text(t))) => Bytes::copy_from_slice(t.as_str().as_bytes()),
            Some(Ok(Message::Close(frame))) => break PumpExit::PeerClosed(frame),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break PumpExit::Failed(Error::io(
                "reading websocket",
                std::io::Error::other(e.to_string()),
            )),
            None => break PumpExit::PeerVanished,
        };
        if is_port_keepalive(&payload) {
            continue;
        }
        let sent = tokio::select! {
            _ = scope.cancelled() => break PumpExit::Cancelled,
            sent = tokio::time::timeout(UDP_WRITE_TIMEOUT, udp.send(&payload)) => sent,
        };
        match sent {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => break PumpExit::Failed(Error::io("writing to game server", e)),
            Err(_) => {
                break PumpExit::Failed(Error::Timeout {
                    addr: udp
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                    timeout: UDP_WRITE_TIMEOUT,
                })
            }
        }
    };
    scope.cancel();
    exit
}

/// UDP → WebSocket, one datagram at a time into a reused buffer.
async fn outbound_pump(
    udp: &UdpSocket,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    scope: &CancellationToken,
) -> PumpExit {
    let mut buffer = vec![0u8; UDP_READ_BUFFER];
    let exit = loop {
        let received = tokio::select! {
            _ = scope.cancelled() => break PumpExit::Cancelled,
            r = udp.recv(&mut buffer) => r,
        };
        let n = match received {
            Ok(n) => n,
            Err(e) => break PumpExit::Failed(Error::io("reading from game server", e)),
        };
        let message = Message::Binary(Bytes::copy_from_slice(&buffer[..n]));
        let sent = tokio::select! {
            _ = scope.cancelled() => break PumpExit::Cancelled,
            sent = ws_tx.send(message) => sent,
        };
        if let Err(e) = sent {
            break PumpExit::Failed(Error::io(
                "writing websocket",
                std::io::Error::other(e.to_string()),
            ));
        }
    };
    scope.cancel();
    exit
}

/// Upgrade handler for the multiplexer's WebSocket branch (any path).
pub async fn tunnel_handler(
    State(proxy): State<Arc<TunnelProxy>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(u) => u,
        Err(rejection) => {
            log::warn!("{}", Error::Upgrade(rejection.body_text()));
            return rejection.into_response();
        }
    };
    let requested: Vec<String> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    upgrade
        .protocols(requested)
        .on_failed_upgrade(|e: axum::Error| log::warn!("{}", Error::Upgrade(e.to_string())))
        .on_upgrade(move |socket| async move { proxy.run_session(socket).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Utf8Bytes;

    #[test]
    fn port_keepalive_detection() {
        assert!(is_port_keepalive(b"\xff\xff\xff\xffport"));
        assert!(is_port_keepalive(b"\xff\xff\xff\xffport 27961"));
        assert!(!is_port_keepalive(b"\xff\xff\xff\xffgetinfo"));
        assert!(!is_port_keepalive(b"port"));
        assert!(!is_port_keepalive(b"\xff\xff\xff\xffpor"));
    }

    fn frame(code: u16) -> CloseFrame {
        CloseFrame {
            code,
            reason: Utf8Bytes::from_static("bye"),
        }
    }

    #[test]
    fn only_unexpected_close_codes_are_abnormal() {
        assert!(!is_abnormal_close(&frame(close_code::NORMAL)));
        assert!(!is_abnormal_close(&frame(close_code::AWAY)));
        assert!(is_abnormal_close(&frame(close_code::PROTOCOL)));
        assert!(is_abnormal_close(&frame(close_code::ERROR)));
    }
}
