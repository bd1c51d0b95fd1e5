//! Pre-TLS tunnel dialing: direct TCP, SOCKS5, or HTTP CONNECT.
//!
//! Produces a raw duplex byte stream to the target host, with any proxy
//! handshake fully consumed so the next protocol layer (TLS) starts on a
//! clean stream. Retry policy belongs to the caller; a failed handshake
//! drops (and thereby closes) the half-open socket before returning.

use base64::Engine as _;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{ProxyEndpoint, ProxyScheme};

/// SOCKS5 protocol version
const SOCKS_VERSION: u8 = 0x05;
/// SOCKS5 CONNECT command
const SOCKS_CMD_CONNECT: u8 = 0x01;
/// SOCKS5 domain-name address type
const SOCKS_ATYP_DOMAIN: u8 = 0x03;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel dial timed out")]
    Timeout,
    #[error("SOCKS5 method negotiation rejected: {0}")]
    Negotiation(String),
    #[error("SOCKS5 connect refused with status {0:#04x}")]
    Refused(u8),
    #[error("malformed proxy reply: {0}")]
    BadReply(String),
    #[error("HTTP CONNECT refused: {0}")]
    HttpRefused(String),
    #[error("hostname exceeds the SOCKS5 255-byte limit")]
    HostTooLong,
}

/// Open a raw byte stream to `host:port`, optionally tunneled through
/// `proxy`. The returned stream is positioned exactly at the start of the
/// tunneled connection.
pub async fn dial(
    host: &str,
    port: u16,
    proxy: Option<&ProxyEndpoint>,
) -> Result<TcpStream, TunnelError> {
    match proxy {
        None => {
            let stream = TcpStream::connect((host, port)).await?;
            debug!("Direct connection to {host}:{port}");
            Ok(stream)
        }
        Some(p) => {
            let mut stream = TcpStream::connect((p.host.as_str(), p.port)).await?;
            match p.scheme {
                ProxyScheme::Socks5 => socks5_connect(&mut stream, host, port).await?,
                ProxyScheme::Http => http_connect(&mut stream, host, port, p).await?,
            }
            debug!("Tunnel to {host}:{port} via {}:{} established", p.host, p.port);
            Ok(stream)
        }
    }
}

/// SOCKS5 handshake: no-auth method negotiation, then a CONNECT request
/// using the domain-name address type.
async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), TunnelError> {
    // Method negotiation: version 5, one method offered, no authentication.
    stream.write_all(&[SOCKS_VERSION, 0x01, 0x00]).await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, 0x00] {
        return Err(TunnelError::Negotiation(format!("{method:02x?}")));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(TunnelError::HostTooLong);
    }

    // CONNECT: version, command, reserved, address type, length-prefixed
    // hostname, big-endian port.
    let mut req = Vec::with_capacity(7 + host_bytes.len());
    req.extend_from_slice(&[
        SOCKS_VERSION,
        SOCKS_CMD_CONNECT,
        0x00,
        SOCKS_ATYP_DOMAIN,
        host_bytes.len() as u8,
    ]);
    req.extend_from_slice(host_bytes);
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(TunnelError::BadReply(format!("version byte {:#04x}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(TunnelError::Refused(reply[1]));
    }

    // Drain the bound-address field so the stream is clean for TLS. Its
    // length depends on the declared address type.
    let drain_len = match reply[3] {
        0x01 => 4 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        0x04 => 16 + 2,
        other => {
            return Err(TunnelError::BadReply(format!("unknown address type {other:#04x}")))
        }
    };
    let mut bound = vec![0u8; drain_len];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// HTTP CONNECT handshake, with Basic proxy authorization when credentials
/// are configured.
async fn http_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &ProxyEndpoint,
) -> Result<(), TunnelError> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(user) = &proxy.username {
        let credentials = format!("{}:{}", user, proxy.password.as_deref().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read until the blank line terminating the response head.
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > 16 * 1024 {
            return Err(TunnelError::BadReply("oversized CONNECT response".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::BadReply("proxy closed during CONNECT".to_string()));
        }
        response.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains("200") {
        return Err(TunnelError::HttpRefused(status_line.trim().to_string()));
    }

    Ok(())
}
