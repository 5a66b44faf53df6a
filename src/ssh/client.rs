//! russh client handler
//!
//! Handles server-initiated events:
//! - host key presentation (accepted and logged; host-key policy lives in config)
//! - transport shutdown (recorded for the registry's closure policy)
//! - `forwarded-tcpip` channels for remote port forwards

use russh::client::{self, DisconnectReason};
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::{record_closure, ClosureSender, TransportClosure};
use crate::forwarding::remote::{handle_forwarded_connection, RemoteForwardTable};

pub struct ClientHandler {
    host: String,
    port: u16,
    closure_tx: ClosureSender,
    remote_forwards: RemoteForwardTable,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        closure_tx: ClosureSender,
        remote_forwards: RemoteForwardTable,
    ) -> Self {
        Self {
            host,
            port,
            closure_tx,
            remote_forwards,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} ({}): {}",
            self.host,
            self.port,
            server_public_key.algorithm(),
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => {
                debug!("Server closed {}:{}", self.host, self.port);
                record_closure(&self.closure_tx, TransportClosure::Clean);
                Ok(())
            }
            DisconnectReason::Error(e) => {
                warn!("Transport to {}:{} failed: {}", self.host, self.port, e);
                record_closure(&self.closure_tx, TransportClosure::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// The server opened a channel for a connection to one of our remote forwards.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "forwarded-tcpip {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(target) = self.remote_forwards.lookup(connected_address, connected_port) else {
            warn!(
                "No remote forward registered for {}:{}, dropping channel",
                connected_address, connected_port
            );
            return Ok(());
        };

        // Called from the SSH event loop; never block here
        tokio::spawn(async move {
            if let Err(e) = handle_forwarded_connection(channel, target).await {
                warn!("Forwarded connection failed: {}", e);
            }
        });

        Ok(())
    }
}
