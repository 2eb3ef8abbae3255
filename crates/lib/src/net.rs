//! Address helpers: host IPv4 detection, host/port splitting and UDP resolution.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Public address used only to pick the outbound interface; no packet is sent.
const ROUTE_TARGET_ADDR: &str = "203.0.113.1:9";

/// Determine the host's primary IPv4 address (the source address the kernel
/// would use for an outbound route). Loopback results are rejected.
pub fn detect_host_ipv4() -> Result<Ipv4Addr> {
    let fail = |reason: String| Error::Resolution {
        addr: "host".to_string(),
        reason,
    };
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| fail(format!("binding route socket: {}", e)))?;
    socket
        .connect(ROUTE_TARGET_ADDR)
        .map_err(|e| fail(format!("no IPv4 route: {}", e)))?;
    match socket.local_addr() {
        Ok(SocketAddr::V4(a)) if !a.ip().is_loopback() && !a.ip().is_unspecified() => Ok(*a.ip()),
        Ok(a) => Err(fail(format!("cannot detect host IPv4 address (got {})", a.ip()))),
        Err(e) => Err(fail(e.to_string())),
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts without resolving.
pub fn split_host_port(addr: &str) -> Result<(String, String)> {
    let bad = |reason: &str| Error::Resolution {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
    let host = if let Some(inner) = host.strip_prefix('[') {
        inner.strip_suffix(']').ok_or_else(|| bad("unbalanced brackets"))?
    } else if host.contains(':') {
        return Err(bad("too many colons"));
    } else {
        host
    };
    if port.is_empty() || port.parse::<u16>().is_err() {
        return Err(bad("invalid port"));
    }
    Ok((host.to_string(), port.to_string()))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Address for locally querying a server bound to `bind_addr`: an unspecified
/// bind host is replaced with loopback.
pub fn local_query_addr(bind_addr: &str) -> Result<String> {
    let (host, port) = split_host_port(bind_addr)?;
    let unspecified = host.is_empty()
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false);
    if unspecified {
        Ok(join_host_port("127.0.0.1", &port))
    } else {
        Ok(bind_addr.to_string())
    }
}

/// Resolve `addr` to a socket address, preferring IPv4 results.
pub async fn resolve(addr: &str) -> Result<SocketAddr> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::Resolution {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| Error::Resolution {
            addr: addr.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Unspecified local address of the same family as `peer`, port 0.
pub fn ephemeral_bind_addr(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    }
}
