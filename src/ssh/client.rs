//! SSH dial using russh
//!
//! Opens and authenticates one SSH connection for one tunnel.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::auth::AuthContext;
use super::error::SshError;

/// Per-run dial parameters, derived from the config file.
#[derive(Debug, Clone, Copy)]
pub struct DialConfig {
    /// Verify server keys against `~/.ssh/known_hosts`. When off (the
    /// default), any server key is accepted.
    pub verify_host_key: bool,
    /// Bound on the TCP connect + SSH handshake.
    pub connect_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            verify_host_key: false,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Open one authenticated SSH connection to `host:port` as `user`.
pub async fn dial(
    host: &str,
    port: u16,
    user: &str,
    auth: &AuthContext,
    config: &DialConfig,
) -> Result<client::Handle<ClientHandler>, SshError> {
    let addr = format!("{host}:{port}");
    info!("Connecting to SSH server at {addr}");

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::Dial(format!("failed to resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| SshError::Dial(format!("no address found for {addr}")))?;

    let ssh_config = client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler {
        host: host.to_string(),
        port,
        verify_host_key: config.verify_host_key,
    };

    let mut handle = tokio::time::timeout(
        config.connect_timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("connection to {addr} timed out")))?
    .map_err(|e| SshError::Dial(e.to_string()))?;

    debug!("SSH handshake with {addr} completed");

    auth.authenticate(&mut handle, user).await?;
    info!("Authenticated to {addr} as {user}");

    Ok(handle)
}

/// russh client callbacks.
///
/// Host key checking is skipped unless `verify_host_key` is set.
pub struct ClientHandler {
    host: String,
    port: u16,
    verify_host_key: bool,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.verify_host_key {
            debug!(
                "Accepting server key for {}:{} without verification",
                self.host, self.port
            );
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "Unknown host key for {}:{}, rejecting (verify_host_key is on)",
                    self.host, self.port
                );
                Err(SshError::Dial(format!(
                    "host key verification failed for {}:{}: key not in known_hosts",
                    self.host, self.port
                )))
            }
            Err(e) => Err(SshError::Dial(format!(
                "host key verification failed for {}:{}: {e}",
                self.host, self.port
            ))),
        }
    }
}
