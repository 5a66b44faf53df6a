//! Proxy traversal
//!
//! Produces the raw byte stream the SSH handshake runs over:
//!
//! ```text
//! direct:  Client --TCP--> Target
//! socks:   Client --TCP--> [SOCKS4/5 proxy] ----> Target
//! http:    Client --TCP--> [HTTP proxy] --CONNECT--> Target
//! ```
//!
//! The resulting `TcpStream` is handed to `russh::client::connect_stream`,
//! the same way hop tunnels hand over a `ChannelStream`.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, info};

use super::error::SshError;
use crate::config::{ProxyKind, ValidProxy};

/// Upper bound for an HTTP CONNECT response header
const MAX_HTTP_HEADER: usize = 8 * 1024;

/// Resolve `host:port` to the first address. Failure is a DNS error, not a
/// connection error.
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, SshError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| SshError::DnsResolution {
            host: host.to_string(),
            message: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| SshError::DnsResolution {
        host: host.to_string(),
        message: "no addresses found".to_string(),
    })
}

/// Plain TCP connection to the target
pub async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, SshError> {
    let addr = resolve_host(host, port).await?;
    debug!("Connecting to {} ({})", host, addr);
    Ok(TcpStream::connect(addr).await?)
}

/// Open a tunnel to `target_host:target_port` through `proxy`
pub async fn connect_via_proxy(
    proxy: &ValidProxy,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, SshError> {
    info!(
        "Connecting to {}:{} via {:?} proxy {}:{}",
        target_host, target_port, proxy.kind, proxy.host, proxy.port
    );

    match proxy.kind {
        ProxyKind::Socks4 => {
            let proxy_addr = resolve_host(&proxy.host, proxy.port).await?;
            let stream = Socks4Stream::connect(proxy_addr, (target_host, target_port))
                .await
                .map_err(|e| SshError::ProxyHandshake(format!("SOCKS4: {}", e)))?;
            Ok(stream.into_inner())
        }
        ProxyKind::Socks5 => {
            let proxy_addr = resolve_host(&proxy.host, proxy.port).await?;
            let stream = Socks5Stream::connect(proxy_addr, (target_host, target_port))
                .await
                .map_err(|e| SshError::ProxyHandshake(format!("SOCKS5: {}", e)))?;
            Ok(stream.into_inner())
        }
        ProxyKind::Http => {
            let mut stream = connect_direct(&proxy.host, proxy.port).await?;
            http_connect(&mut stream, target_host, target_port).await?;
            Ok(stream)
        }
    }
}

async fn http_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_authority(host, port);
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| SshError::ProxyHandshake(format!("HTTP CONNECT write: {}", e)))?;

    // Byte at a time: anything past the header belongs to the SSH server
    let mut header = Vec::with_capacity(256);
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(SshError::ProxyHandshake(
                "HTTP CONNECT response header too large".to_string(),
            ));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            SshError::ProxyHandshake(format!("HTTP CONNECT read: {}", e))
        })?;
        header.push(byte);
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or_default();
    let status = parse_status_code(status_line).ok_or_else(|| {
        SshError::ProxyHandshake(format!("malformed HTTP status line: {:?}", status_line))
    })?;
    if !(200..300).contains(&status) {
        return Err(SshError::ProxyHandshake(format!(
            "proxy refused CONNECT: {}",
            status_line.trim()
        )));
    }
    debug!("HTTP CONNECT to {} established", authority);
    Ok(())
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_status_code(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 Connection established"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.0 407 Proxy Authentication Required"), Some(407));
        assert_eq!(parse_status_code("SSH-2.0-OpenSSH"), None);
    }

    #[test]
    fn test_ipv6_authority() {
        assert_eq!(format_authority("::1", 22), "[::1]:22");
        assert_eq!(format_authority("example.com", 22), "example.com:22");
    }

    #[tokio::test]
    async fn test_http_connect_leaves_trailing_bytes() {
        let (mut client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nSSH-2.0-test\r\n")
                .await
                .unwrap();
            request
        });

        http_connect(&mut client, "10.0.0.1", 22).await.unwrap();
        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT 10.0.0.1:22 HTTP/1.1\r\n"));

        let mut banner = [0u8; 12];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-test");
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        });
        let err = http_connect(&mut client, "10.0.0.1", 22).await.unwrap_err();
        assert!(matches!(err, SshError::ProxyHandshake(ref m) if m.contains("403")));
    }

    #[tokio::test]
    async fn test_unresolvable_proxy_is_dns_error() {
        let proxy = ValidProxy {
            kind: ProxyKind::Socks5,
            host: "proxy.invalid".into(),
            port: 1080,
        };
        let err = connect_via_proxy(&proxy, "10.0.0.1", 22).await.unwrap_err();
        assert!(matches!(err, SshError::DnsResolution { .. }));
    }
}
