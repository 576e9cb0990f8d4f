//! Forwarding session
//!
//! One session per tunnel: dial the SSH endpoint, bind the local listener,
//! then accept local connections forever and relay each one through a
//! `direct-tcpip` channel to the tunnel's remote endpoint.
//!
//! Failure policy: a dial or listen failure ends the session before the
//! accept loop starts; an accept failure ends the session; a failed remote
//! dial ends only that one connection attempt; relay copy errors are logged
//! and never propagated.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::client;
use russh::Disconnect;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ResolvedTunnel;
use crate::ssh::{self, AuthContext, ClientHandler, DialConfig, SshError};

/// Run one tunnel until it fails or `shutdown` fires.
///
/// The SSH connection and the local listener are both released on every exit
/// path. Returns `Ok(())` only for shutdown-driven exits; the accept loop
/// itself is infinite.
pub async fn run_tunnel(
    tunnel: ResolvedTunnel,
    auth: Arc<AuthContext>,
    dial_config: DialConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), SshError> {
    let handle = ssh::dial(
        &tunnel.ssh_host,
        tunnel.ssh_port,
        &tunnel.ssh_user,
        &auth,
        &dial_config,
    )
    .await?;
    let handle = Arc::new(handle);

    let listener = match bind_local(&tunnel).await {
        Ok(listener) => listener,
        Err(e) => {
            disconnect(&handle).await;
            return Err(e);
        }
    };

    println!(
        "Listening on {}:{} and forwarding to {}:{}",
        tunnel.local_host, tunnel.local_port, tunnel.remote_host, tunnel.remote_port
    );
    info!(
        "Session established: {} -> {} via {}",
        tunnel.local_addr(),
        tunnel.remote_addr(),
        tunnel.ssh_addr()
    );

    let result = loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Session {} stopped by shutdown", tunnel.local_addr());
                break Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {e}");
                    }
                    debug!("Accepted {peer} on {}", tunnel.local_addr());

                    let handle = handle.clone();
                    let tunnel = tunnel.clone();
                    tokio::spawn(async move {
                        handle_connection(handle, stream, peer, tunnel).await;
                    });
                }
                Err(e) => break Err(SshError::Accept(e)),
            }
        }
    };

    disconnect(&handle).await;
    result
}

/// Bind the tunnel's local listener.
async fn bind_local(tunnel: &ResolvedTunnel) -> Result<TcpListener, SshError> {
    TcpListener::bind(tunnel.local_addr())
        .await
        .map_err(|source| SshError::Listen {
            addr: tunnel.local_addr(),
            source,
        })
}

/// One accepted local connection: open the remote channel and relay.
async fn handle_connection(
    handle: Arc<client::Handle<ClientHandler>>,
    local: TcpStream,
    peer: SocketAddr,
    tunnel: ResolvedTunnel,
) {
    let channel = match handle
        .channel_open_direct_tcpip(
            &tunnel.remote_host,
            tunnel.remote_port as u32,
            &peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            // Local stream closes on drop; the session keeps accepting.
            warn!(
                "{}",
                SshError::RemoteDial {
                    addr: tunnel.remote_addr(),
                    reason: e.to_string(),
                }
            );
            return;
        }
    };

    let (sent, received) = relay(local, channel.into_stream()).await;
    debug!(
        "Relay {} -> {} closed ({sent} bytes out, {received} bytes in)",
        peer,
        tunnel.remote_addr()
    );
}

/// Splice bytes both directions until either side finishes.
///
/// The two copies run concurrently; when one ends (EOF or error) the other is
/// cancelled and both streams are dropped, closing them. Returns
/// (local→remote, remote→local) byte counts.
pub async fn relay<L, R>(local: L, remote: R) -> (u64, u64)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut sent = 0u64;
    let mut received = 0u64;

    tokio::select! {
        copied = tokio::io::copy(&mut local_read, &mut remote_write) => match copied {
            Ok(n) => sent = n,
            Err(e) => debug!("local -> remote copy ended: {e}"),
        },
        copied = tokio::io::copy(&mut remote_read, &mut local_write) => match copied {
            Ok(n) => received = n,
            Err(e) => debug!("remote -> local copy ended: {e}"),
        },
    }

    (sent, received)
}

async fn disconnect(handle: &client::Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "shutting down", "en")
        .await
    {
        debug!("SSH disconnect: {e}");
    }
}
