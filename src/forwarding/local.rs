//! Local Port Forwarding
//!
//! Listens on a local address and opens a direct-tcpip (or direct-streamlocal)
//! channel through the session for every accepted connection.

use std::io;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::{bridge, BindAddress, ForwardRuntime, ForwardTarget, StopCause};
use crate::ssh::{HandleController, SshError};

/// Bind the listener and spawn the accept loop. Returns the bound address.
pub(super) async fn start(
    bind: &BindAddress,
    target: ForwardTarget,
    mut runtime: ForwardRuntime,
) -> Result<String, SshError> {
    let listener = bind_listener(bind).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?
        .to_string();
    info!("[Forward] Local {} -> {}", bound, target);

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
                        debug!("[Forward] {} accepted {}", label, peer);
                        let controller = runtime.controller.clone();
                        let target = target.clone();
                        let guard = runtime.counters.open();
                        let counters = runtime.counters.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) = forward_connection(&controller, stream, &target, &counters).await {
                                warn!("[Forward] Connection to {} failed: {}", target, e);
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
        match cause {
            StopCause::Requested => info!("[Forward] Local {} stopped", label),
            StopCause::Disconnected => info!("[Forward] Local {} stopped: transport closed", label),
        }
    });

    Ok(bound)
}

async fn bind_listener(bind: &BindAddress) -> Result<TcpListener, SshError> {
    let addr = bind.to_string();
    TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!("Port already in use: {}", addr)),
        io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
    })
}

async fn forward_connection(
    controller: &HandleController,
    stream: TcpStream,
    target: &ForwardTarget,
    counters: &super::ForwardCounters,
) -> Result<(), SshError> {
    let channel = match target {
        ForwardTarget::Tcp { host, port } => {
            let (origin_host, origin_port) = stream
                .peer_addr()
                .map(|a| (a.ip().to_string(), a.port() as u32))
                .unwrap_or_else(|_| ("127.0.0.1".to_string(), 0));
            controller
                .open_direct_tcpip(host, *port as u32, &origin_host, origin_port)
                .await?
        }
        ForwardTarget::Socket { path } => controller.open_direct_streamlocal(path).await?,
    };
    bridge(stream, channel, counters).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::FakeTransport;
    use tokio::io::AsyncReadExt;

    fn loopback() -> BindAddress {
        BindAddress {
            address: "127.0.0.1".into(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_accepts_and_stops() {
        let fake = FakeTransport::bash("/root");
        let runtime = ForwardRuntime::new(fake.controller());
        let stop = runtime.stop.clone();
        let counters = runtime.counters.clone();

        let target = ForwardTarget::Tcp {
            host: "db".into(),
            port: 5432,
        };
        let bound = start(&loopback(), target, runtime).await.unwrap();
        assert!(bound.starts_with("127.0.0.1:"));

        // The fake refuses the channel, so the client sees EOF
        let mut client = TcpStream::connect(&bound).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(counters.snapshot().connection_count, 1);

        stop.send_replace(true);
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(&bound).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "listener still accepting after stop");
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = BindAddress {
            address: "127.0.0.1".into(),
            port: taken.local_addr().unwrap().port(),
        };
        let fake = FakeTransport::bash("/root");
        let err = start(&bind, ForwardTarget::Socket { path: "/s".into() }, ForwardRuntime::new(fake.controller()))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::ConnectionFailed(ref m) if m.contains("in use")));
    }
}
