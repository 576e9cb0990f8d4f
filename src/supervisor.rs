//! Session supervisor
//!
//! Startup phase: resolve tunnels, sync the hosts file, build the per-run
//! authentication context (spawning an ssh-agent when configured), start one
//! forwarding session per tunnel. Any failure here is fatal and nothing
//! starts.
//!
//! Run phase: a session failure ends only that session; siblings keep
//! forwarding. The supervisor blocks until an interrupt or termination
//! signal arrives.
//!
//! Shutdown phase: broadcast shutdown to sessions, terminate the agent this
//! run spawned (exactly once, errors logged), remove the hosts-file aliases
//! (errors logged).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{AuthStrategy, Config, ResolvedTunnel, SshSettings};
use crate::forwarding;
use crate::hosts::HostsFile;
use crate::ssh::{self, AgentProcess, AuthContext, DialConfig, SshError};
use crate::AppError;

/// Run every tunnel matching `tags` until a termination signal arrives.
pub async fn run(config: &Config, tags: &[String]) -> Result<(), AppError> {
    let tunnels = config.ssh.resolve_all(tags)?;
    if tunnels.is_empty() {
        warn!("No tunnels matched the given tags, nothing to do");
        return Ok(());
    }

    let hosts = HostsFile::system();
    hosts.add_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str()))?;

    // The agent handle, if any, is owned here and consumed in the shutdown
    // phase below.
    let (auth, agent) = build_auth_with_cleanup(&config.ssh, &hosts, &tunnels).await?;
    let auth = Arc::new(auth);
    let dial_config = DialConfig {
        verify_host_key: config.ssh.verify_host_key,
        connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut sessions: JoinSet<(String, Result<(), SshError>)> = JoinSet::new();

    for tunnel in tunnels.iter().cloned() {
        let label = tunnel.local_addr();
        let auth = auth.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        sessions.spawn(async move {
            let result = forwarding::run_tunnel(tunnel, auth, dial_config, shutdown_rx).await;
            (label, result)
        });
    }
    info!("Started {} forwarding session(s)", tunnels.len());

    println!("Press Ctrl+C to exit");

    let signal = wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                info!("Termination signal received, shutting down");
                break;
            }
            // When the set is empty this branch disables itself and only the
            // signal remains.
            Some(joined) = sessions.join_next() => {
                match joined {
                    Ok((label, Ok(()))) => info!("Session {label} ended"),
                    // One tunnel down; the others keep forwarding.
                    Ok((label, Err(e))) => error!("Session {label} failed: {e}"),
                    Err(e) => error!("Session task panicked: {e}"),
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    let drain = async {
        while let Some(joined) = sessions.join_next().await {
            if let Ok((label, Err(e))) = joined {
                warn!("Session {label} ended with error during shutdown: {e}");
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Timed out waiting for sessions to stop");
        sessions.abort_all();
    }

    if let Some(agent) = agent {
        if let Err(e) = agent.terminate() {
            warn!("{e}");
        } else {
            info!("Terminated ssh-agent");
        }
    }

    if let Err(e) = hosts.remove_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str())) {
        warn!("Hosts cleanup failed: {e}");
    }

    Ok(())
}

/// [`build_auth`], undoing the hosts-file sync on failure.
///
/// The aliases were added just before this runs; a startup abort must not
/// leave them behind. Removal is best-effort and logged, the auth error is
/// what propagates.
async fn build_auth_with_cleanup(
    settings: &SshSettings,
    hosts: &HostsFile,
    tunnels: &[ResolvedTunnel],
) -> Result<(AuthContext, Option<AgentProcess>), AppError> {
    match build_auth(settings).await {
        Ok(built) => Ok(built),
        Err(e) => {
            if let Err(he) =
                hosts.remove_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str()))
            {
                warn!("Hosts cleanup failed: {he}");
            }
            Err(e)
        }
    }
}

/// Build the per-run [`AuthContext`].
///
/// Agent strategy spawns a dedicated agent and injects the configured key
/// into it; the returned [`AgentProcess`] must be terminated at shutdown. If
/// key injection fails the just-spawned agent is terminated immediately.
async fn build_auth(
    settings: &SshSettings,
) -> Result<(AuthContext, Option<AgentProcess>), AppError> {
    let key_path = settings.private_key_path()?;

    match settings.auth {
        AuthStrategy::Key => {
            let auth = AuthContext::with_key_file(&key_path)?;
            Ok((auth, None))
        }
        AuthStrategy::Agent => {
            let agent = ssh::spawn_agent().await?;

            let inject = async {
                let key = ssh::load_private_key(&key_path)?;
                ssh::add_key(&agent, &key).await?;
                Ok::<(), SshError>(())
            };
            if let Err(e) = inject.await {
                if let Err(te) = agent.terminate() {
                    warn!("{te}");
                }
                return Err(e.into());
            }

            Ok((AuthContext::for_agent(agent.socket.clone()), Some(agent)))
        }
    }
}

/// Resolve when an interrupt (Ctrl+C) or, on Unix, SIGTERM arrives.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use std::io::Write;

    #[tokio::test]
    async fn failed_auth_build_removes_fresh_aliases() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"127.0.0.1\tlocalhost\n").unwrap();
        let hosts = HostsFile::at(file.path());

        // No private_key, so building the auth context fails before any
        // agent is spawned.
        let settings: SshSettings = serde_yaml::from_str(
            r#"
            default_ssh_user: alice
            default_ssh_host: bastion
            tunnels:
              - remote_host: db.internal
                remote_port: 5432
                local_host: db.local
                local_port: 15432
            "#,
        )
        .unwrap();
        let tunnels = settings.resolve_all(&[]).unwrap();

        hosts
            .add_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str()))
            .unwrap();

        let err = build_auth_with_cleanup(&settings, &hosts, &tunnels)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::MissingPrivateKey)
        ));

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert!(!contents.contains("db.local"));
        assert!(contents.contains("localhost"));
    }
}
