//! Out-of-band (connectionless) query protocol: `getinfo` and `getstatus`.
//!
//! Requests are a single datagram: four `0xFF` bytes followed by the ASCII
//! command. Responses carry a keyword line, a `\key\value` line and, for
//! status, one line per player (`<score> <ping> "<name>"`).

use crate::error::{Error, Result};
use crate::net;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::UdpSocket;

pub const OUT_OF_BAND_HEADER: &[u8; 4] = b"\xff\xff\xff\xff";
pub const GET_INFO_COMMAND: &str = "getinfo";
pub const GET_STATUS_COMMAND: &str = "getstatus";

/// Round-trip deadline for one command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 1024 * 1024;
const FIELD_DELIMITER: u8 = b'\\';

/// Parsed `getinfo` response (also the configuration part of a status response).
pub type InfoResponse = BTreeMap<String, String>;

/// One entry of the status player block, in server-reported order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Player {
    pub name: String,
    pub ping: i64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    pub configuration: InfoResponse,
    pub players: Vec<Player>,
}

/// Client for the out-of-band protocol. Every command uses a freshly bound
/// ephemeral socket, so the client is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct OobClient {
    timeout: Duration,
}

impl Default for OobClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OobClient {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Send `command` to `addr` and return the payload of the first datagram received.
    pub async fn send_command(&self, addr: &str, command: &str) -> Result<Vec<u8>> {
        let target = net::resolve(addr).await?;
        let socket = UdpSocket::bind(net::ephemeral_bind_addr(&target))
            .await
            .map_err(|e| Error::io("binding query socket", e))?;

        let mut packet = Vec::with_capacity(OUT_OF_BAND_HEADER.len() + command.len());
        packet.extend_from_slice(OUT_OF_BAND_HEADER);
        packet.extend_from_slice(command.as_bytes());

        let exchange = async {
            socket
                .send_to(&packet, target)
                .await
                .map_err(|e| Error::io(format!("sending {} to {}", command, addr), e))?;
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            let (n, _) = socket
                .recv_from(&mut buffer)
                .await
                .map_err(|e| Error::io(format!("reading {} reply from {}", command, addr), e))?;
            buffer.truncate(n);
            Ok(buffer)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                addr: addr.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    pub async fn get_info(&self, addr: &str) -> Result<InfoResponse> {
        let resp = self.send_command(addr, GET_INFO_COMMAND).await?;
        Ok(parse_info(&resp))
    }

    pub async fn get_status(&self, addr: &str) -> Result<StatusResponse> {
        let resp = self.send_command(addr, GET_STATUS_COMMAND).await?;
        parse_status(&resp)
    }
}

/// Parse an info payload: everything through the first newline is dropped,
/// then `\key\value...` pairs are folded into a map. An unpaired trailing key
/// is discarded; duplicate keys keep the last value.
pub fn parse_info(data: &[u8]) -> InfoResponse {
    let data = match data.iter().position(|&b| b == b'\n') {
        Some(i) => &data[i + 1..],
        None => data,
    };
    parse_key_values(data)
}

fn parse_key_values(data: &[u8]) -> InfoResponse {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    let data = data.strip_prefix(&[FIELD_DELIMITER]).unwrap_or(data);
    let data = data.strip_suffix(&[FIELD_DELIMITER]).unwrap_or(data);
    let mut map = InfoResponse::new();
    if data.is_empty() {
        return map;
    }
    let parts: Vec<&[u8]> = data.split(|&b| b == FIELD_DELIMITER).collect();
    for pair in parts.chunks_exact(2) {
        map.insert(
            String::from_utf8_lossy(pair[0]).into_owned(),
            String::from_utf8_lossy(pair[1]).into_owned(),
        );
    }
    map
}

/// Parse a status payload into configuration and player list.
pub fn parse_status(data: &[u8]) -> Result<StatusResponse> {
    let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
    let segments: Vec<&[u8]> = trimmed.splitn(3, |&b| b == b'\n').collect();
    match segments.as_slice() {
        [_, config] => Ok(StatusResponse {
            configuration: parse_key_values(config),
            players: Vec::new(),
        }),
        [_, config, players] => Ok(StatusResponse {
            configuration: parse_key_values(config),
            players: parse_players(players)?,
        }),
        _ => Err(Error::Protocol(format!(
            "cannot parse response: \"{}\"",
            data.escape_ascii()
        ))),
    }
}

fn parse_players(block: &[u8]) -> Result<Vec<Player>> {
    let mut players = Vec::new();
    for line in block.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let fields: Vec<&str> = line.splitn(3, ' ').collect();
        let [score, ping, name] = fields.as_slice() else {
            continue;
        };
        let name = unquote(name)
            .ok_or_else(|| Error::Protocol(format!("invalid player name {}", name)))?;
        let ping = ping
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid ping {:?} for {}", ping, name)))?;
        let score = score
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid score {:?} for {}", score, name)))?;
        players.push(Player { name, ping, score });
    }
    Ok(players)
}

/// Remove surrounding double quotes and resolve backslash escapes.
/// Returns None for unterminated strings or bare interior quotes.
fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return None,
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                other @ ('\\' | '"' | '\'') => out.push(other),
                _ => return None,
            },
            c => out.push(c),
        }
    }
    Some(out)
}
