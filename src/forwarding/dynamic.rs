//! Dynamic Port Forwarding (SOCKS5)
//!
//! A local SOCKS5 front-end: every CONNECT request becomes a direct-tcpip
//! channel through the session. Only the no-auth method and the CONNECT
//! command are supported.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::{bridge, BindAddress, ForwardCounters, ForwardRuntime};
use crate::ssh::{HandleController, SshError};

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_UNACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

pub(super) async fn start(bind: &BindAddress, mut runtime: ForwardRuntime) -> Result<String, SshError> {
    let addr = bind.to_string();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)))?;
    let bound = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?
        .to_string();
    info!("[Forward] SOCKS5 proxy on {}", bound);

    let label = bound.clone();
    tokio::spawn(async move {
        let cause = loop {
            tokio::select! {
                cause = runtime.stopped() => break cause,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("[Forward] SOCKS5 client {}", peer);
                        let controller = runtime.controller.clone();
                        let guard = runtime.counters.open();
                        let counters = runtime.counters.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) = handle_socks5_connection(&controller, stream, &counters).await {
                                debug!("[Forward] SOCKS5 connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[Forward] Accept on {} failed: {}", label, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        };
        info!("[Forward] SOCKS5 proxy {} stopped ({:?})", label, cause);
    });

    Ok(bound)
}

fn socks_error(what: &str, e: std::io::Error) -> SshError {
    SshError::ProxyHandshake(format!("SOCKS5 {}: {}", what, e))
}

async fn handle_socks5_connection(
    controller: &HandleController,
    mut stream: TcpStream,
    counters: &ForwardCounters,
) -> Result<(), SshError> {
    let mut buf = [0u8; 258];

    // Greeting: VER | NMETHODS | METHODS
    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| socks_error("greeting", e))?;
    if buf[0] != socks5::VERSION {
        return Err(SshError::ProxyHandshake(format!(
            "Unsupported SOCKS version: {}",
            buf[0]
        )));
    }
    let nmethods = buf[1] as usize;
    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| socks_error("auth methods", e))?;
    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        let _ = stream
            .write_all(&[socks5::VERSION, socks5::AUTH_UNACCEPTABLE])
            .await;
        return Err(SshError::ProxyHandshake(
            "client does not offer the no-auth method".into(),
        ));
    }
    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| socks_error("auth reply", e))?;

    // Request: VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| socks_error("request", e))?;
    let (cmd, atyp) = (buf[1], buf[3]);
    if cmd != socks5::CMD_CONNECT {
        send_reply(&mut stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SshError::ProxyHandshake(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    let (host, port) = match atyp {
        socks5::ATYP_IPV4 => {
            stream
                .read_exact(&mut buf[..6])
                .await
                .map_err(|e| socks_error("IPv4 address", e))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            (ip.to_string(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        socks5::ATYP_DOMAIN => {
            stream
                .read_exact(&mut buf[..1])
                .await
                .map_err(|e| socks_error("domain length", e))?;
            let len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..len + 2])
                .await
                .map_err(|e| socks_error("domain", e))?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            (domain, u16::from_be_bytes([buf[len], buf[len + 1]]))
        }
        socks5::ATYP_IPV6 => {
            stream
                .read_exact(&mut buf[..18])
                .await
                .map_err(|e| socks_error("IPv6 address", e))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            (
                Ipv6Addr::from(octets).to_string(),
                u16::from_be_bytes([buf[16], buf[17]]),
            )
        }
        _ => {
            send_reply(&mut stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SshError::ProxyHandshake(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    let (origin_host, origin_port) = stream
        .peer_addr()
        .map(|a| (a.ip().to_string(), a.port() as u32))
        .unwrap_or_else(|_| ("127.0.0.1".to_string(), 0));
    let channel = match controller
        .open_direct_tcpip(&host, port as u32, &origin_host, origin_port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("[Forward] SOCKS5 channel to {}:{} failed: {}", host, port, e);
            send_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };
    send_reply(&mut stream, socks5::REP_SUCCESS).await?;
    debug!("[Forward] SOCKS5 tunnel to {}:{}", host, port);

    bridge(stream, channel, counters).await
}

/// Bound address is always reported as 0.0.0.0:0
async fn send_reply(stream: &mut TcpStream, status: u8) -> Result<(), SshError> {
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream
        .write_all(&reply)
        .await
        .map_err(|e| socks_error("reply", e))
}
