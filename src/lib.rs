//! portward - SSH local port-forwarding tunnel manager.
//!
//! Reads a static tunnel list from a YAML config, maps each tunnel's local
//! hostname to loopback in the hosts file, opens one SSH session per tunnel
//! and forwards every connection accepted on the tunnel's local port through
//! a `direct-tcpip` channel to its remote endpoint, until interrupted.

pub mod cli;
pub mod config;
pub mod forwarding;
pub mod hosts;
pub mod logging;
pub mod ssh;
pub mod supervisor;

use thiserror::Error;

/// Fatal startup errors. Anything that happens after the sessions are up is
/// handled (and at most logged) by the supervisor instead.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Ssh(#[from] ssh::SshError),

    #[error(transparent)]
    Hosts(#[from] hosts::HostsError),
}
